//! Top-level facade crate for wavelink.
//!
//! Re-exports core types and the gateway library so users can depend on a
//! single crate.

pub mod core {
    pub use wavelink_core::*;
}

pub mod gateway {
    pub use wavelink_gateway::*;
}
