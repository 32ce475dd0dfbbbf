//! wavelink gateway library entry.
//!
//! This crate assembles the server side of the realtime engine:
//! - Engine: session table, request verification, handshake, and the
//!   HTTP -> WebSocket upgrade dispatcher.
//! - Session: per-client state machine, send buffer, heartbeat scheduler,
//!   and upgrade coordinator.
//! - Transports: request/response long-polling and framed WebSocket behind
//!   one tagged abstraction; a live session migrates between them without
//!   losing buffered packets.
//! - Router: axum wiring for the polling GET/POST pair and the upgrade
//!   endpoint, with optional response compression and a sticky-session
//!   cookie.
//!
//! The gateway is designed for panic-free operation: protocol violations
//! surface as structured JSON rejections and transport faults close only
//! the affected session. This crate is consumed by the binary (`main.rs`)
//! and by integration tests.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod engine;
pub mod router;
pub mod transport;

pub use engine::{CloseReason, Engine, EngineBuilder, Session, SessionEvent};
pub use router::build_router;
