//! Transport abstraction.
//!
//! A transport is an ordered packet channel with a liveness/writable state.
//! Two variants exist: request/response long-polling and framed WebSocket.
//! Shared state lives in [`TransportBase`]; the variants are a tagged enum,
//! so consumers that need polling-only operations must match first.
//!
//! Transports never call into the session directly. They emit
//! [`TransportSignal`]s into a channel whose receiver the session (or the
//! upgrade prober) consumes; the pump task that drains it is the "listener
//! handle" the session installs on bind and aborts on unbind.

mod polling;
mod ws;

pub use polling::{DataGuard, PollBody, PollingTransport};
pub use ws::{run_ws_socket, WsOut, WsTransport};

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::mpsc;
use wavelink_core::packet::Packet;
use wavelink_core::WavelinkError;

/// Wire name of a transport variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Polling,
    WebSocket,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Polling => "polling",
            TransportKind::WebSocket => "websocket",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "polling" => Some(TransportKind::Polling),
            "websocket" => Some(TransportKind::WebSocket),
            _ => None,
        }
    }
}

/// Signals a transport emits toward its session.
#[derive(Debug)]
pub enum TransportSignal {
    /// A decoded inbound packet.
    Packet(Packet),
    /// A write batch was handed to the wire; writable may have flipped.
    Drain,
    /// Fatal transport fault. A `Close` follows.
    Error(WavelinkError),
    /// The transport is gone; emitted at most once.
    Close,
}

pub type SignalTx = mpsc::UnboundedSender<TransportSignal>;
pub type SignalRx = mpsc::UnboundedReceiver<TransportSignal>;

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closing,
    Closed,
}

/// State shared by both transport variants.
#[derive(Debug)]
pub struct TransportBase {
    state: AtomicU8,
    discarded: AtomicBool,
    supports_binary: bool,
    signals: SignalTx,
}

impl TransportBase {
    pub fn new(signals: SignalTx, supports_binary: bool) -> Self {
        Self {
            state: AtomicU8::new(TransportState::Open as u8),
            discarded: AtomicBool::new(false),
            supports_binary,
            signals,
        }
    }

    pub fn state(&self) -> TransportState {
        match self.state.load(Ordering::Acquire) {
            0 => TransportState::Open,
            1 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }

    pub fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Mark the transport as superseded. Idempotent; once set, faults on
    /// this transport are expected and swallowed.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    pub fn discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub fn supports_binary(&self) -> bool {
        self.supports_binary
    }

    /// Emit a signal unless the transport was discarded; a discarded
    /// transport stays silent so upgrade races cannot resurrect a session.
    pub fn signal(&self, signal: TransportSignal) {
        if self.discarded() {
            tracing::debug!(?signal, "signal on discarded transport dropped");
            return;
        }
        let _ = self.signals.send(signal);
    }
}

/// A concrete transport bound (or about to be bound) to a session.
#[derive(Debug)]
pub enum Transport {
    Polling(PollingTransport),
    WebSocket(WsTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Polling(_) => TransportKind::Polling,
            Transport::WebSocket(_) => TransportKind::WebSocket,
        }
    }

    fn base(&self) -> &TransportBase {
        match self {
            Transport::Polling(t) => t.base(),
            Transport::WebSocket(t) => t.base(),
        }
    }

    /// True iff packet boundaries survive the wire. Polling concatenates.
    pub fn supports_framing(&self) -> bool {
        matches!(self, Transport::WebSocket(_))
    }

    /// True iff this transport can be the target of an upgrade.
    pub fn handles_upgrades(&self) -> bool {
        matches!(self, Transport::WebSocket(_))
    }

    pub fn supports_binary(&self) -> bool {
        self.base().supports_binary()
    }

    pub fn state(&self) -> TransportState {
        self.base().state()
    }

    /// May the next `send` be handed to the wire immediately?
    pub fn writable(&self) -> bool {
        match self {
            Transport::Polling(t) => t.writable(),
            Transport::WebSocket(t) => t.writable(),
        }
    }

    pub fn discard(&self) {
        self.base().discard()
    }

    pub fn discarded(&self) -> bool {
        self.base().discarded()
    }

    /// Enqueue a batch for write. Never blocks; completion is signaled with
    /// `Drain` (one per packet on framed transports, one per response on
    /// polling).
    pub fn send(&self, packets: Vec<Packet>) {
        match self {
            Transport::Polling(t) => t.send(packets),
            Transport::WebSocket(t) => t.send(packets),
        }
    }

    /// Orderly shutdown. Emits `Close` exactly once; a close packet is
    /// written first when the wire still allows it.
    pub fn close(&self) {
        match self {
            Transport::Polling(t) => t.close(),
            Transport::WebSocket(t) => t.close(),
        }
    }

    pub fn as_polling(&self) -> Option<&PollingTransport> {
        match self {
            Transport::Polling(t) => Some(t),
            Transport::WebSocket(_) => None,
        }
    }
}
