//! Session-level events delivered to the application observer.

use wavelink_core::packet::{Packet, PacketData};

use crate::transport::TransportKind;

/// Why a session ended. Carried by [`SessionEvent::Close`]; the wire/string
/// forms are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No pong arrived within the ping timeout.
    PingTimeout,
    /// I/O fault on the active transport.
    TransportError,
    /// The active transport went away (socket close, client close packet).
    TransportClose,
    /// Undecodable bytes from the client.
    ParseError,
    /// Explicit `close()` by the application.
    ForcedClose,
    /// Global engine shutdown.
    ServerClose,
    /// The client sent a packet only the server may send.
    ClientError,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::TransportError => "transport error",
            CloseReason::TransportClose => "transport close",
            CloseReason::ParseError => "parse error",
            CloseReason::ForcedClose => "forced close",
            CloseReason::ServerClose => "server close",
            CloseReason::ClientError => "client error",
        }
    }
}

/// Everything a session reports upward. `Close` is emitted exactly once per
/// session; after it, the stream ends.
#[derive(Debug)]
pub enum SessionEvent {
    /// The session reached the open state and the handshake packet is queued.
    Open,
    /// Any inbound packet, before type dispatch.
    Packet(Packet),
    /// An outbound packet was accepted into the write buffer.
    PacketCreate(Packet),
    /// Payload of an inbound message packet.
    Message(PacketData),
    /// A batch left the write buffer for the transport.
    Flush(Vec<Packet>),
    /// The write buffer emptied.
    Drain,
    /// A probe succeeded on a candidate transport.
    Upgrading(TransportKind),
    /// The session committed to a new transport.
    Upgrade(TransportKind),
    /// Liveness observed (inbound ping or pong).
    Heartbeat,
    /// Fault on the active transport; a `Close` follows.
    Error(String),
    Close {
        reason: CloseReason,
        description: Option<String>,
    },
}
