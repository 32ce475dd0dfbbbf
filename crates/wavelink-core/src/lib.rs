//! wavelink core: packet model, wire codec, and error taxonomy (transport-agnostic).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod codec;
pub mod error;
pub mod packet;

/// Shared result type.
pub use error::{ProtocolCode, Result, WavelinkError};
