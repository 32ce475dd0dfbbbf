//! WebSocket transport.
//!
//! Wraps an already-upgraded axum WebSocket. A socket pump task owns the
//! connection: it writes queued packets (one WebSocket message per packet,
//! one `Drain` per completed write) and decodes inbound frames into packet
//! signals. The transport handle itself only queues.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use wavelink_core::codec::{self, Encoded};
use wavelink_core::packet::Packet;
use wavelink_core::WavelinkError;

use super::{SignalTx, Transport, TransportBase, TransportSignal, TransportState};

#[derive(Debug)]
pub enum WsOut {
    Packet(Packet),
    Terminate,
}

#[derive(Debug)]
pub struct WsTransport {
    base: TransportBase,
    out_tx: mpsc::UnboundedSender<WsOut>,
}

impl WsTransport {
    pub fn new(
        signals: SignalTx,
        supports_binary: bool,
    ) -> (Self, mpsc::UnboundedReceiver<WsOut>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                base: TransportBase::new(signals, supports_binary),
                out_tx,
            },
            out_rx,
        )
    }

    pub fn base(&self) -> &TransportBase {
        &self.base
    }

    /// A live WebSocket accepts writes at any time.
    pub fn writable(&self) -> bool {
        self.base.state() == TransportState::Open
    }

    pub fn send(&self, packets: Vec<Packet>) {
        if self.base.discarded() || self.base.state() != TransportState::Open {
            return;
        }
        for p in packets {
            let _ = self.out_tx.send(WsOut::Packet(p));
        }
    }

    pub fn close(&self) {
        if self.base.state() != TransportState::Open {
            return;
        }
        self.base.set_state(TransportState::Closing);
        let _ = self.out_tx.send(WsOut::Packet(Packet::close()));
        let _ = self.out_tx.send(WsOut::Terminate);
    }
}

/// Socket pump: owns the upgraded connection until either side goes away.
///
/// The future completes when the socket is done, so callers run it as the
/// body of `on_upgrade`.
pub async fn run_ws_socket(
    socket: WebSocket,
    transport: Arc<Transport>,
    mut out_rx: mpsc::UnboundedReceiver<WsOut>,
) {
    let supports_binary = transport.supports_binary();
    let base = match transport.as_ref() {
        Transport::WebSocket(t) => t.base(),
        Transport::Polling(_) => {
            tracing::error!("ws pump started on a polling transport");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(WsOut::Packet(p)) => {
                    let msg = match codec::encode_packet(&p, supports_binary) {
                        Encoded::Text(s) => Message::Text(s),
                        Encoded::Binary(b) => Message::Binary(b.to_vec()),
                    };
                    if let Err(e) = ws_tx.send(msg).await {
                        base.signal(TransportSignal::Error(WavelinkError::Transport(
                            e.to_string(),
                        )));
                        break;
                    }
                    base.signal(TransportSignal::Drain);
                }
                Some(WsOut::Terminate) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(s))) => match codec::decode_packet_text(&s) {
                    Ok(p) => base.signal(TransportSignal::Packet(p)),
                    Err(e) => {
                        base.signal(TransportSignal::Error(e));
                        break;
                    }
                },
                Some(Ok(Message::Binary(b))) => match codec::decode_packet_binary(&b) {
                    Ok(p) => base.signal(TransportSignal::Packet(p)),
                    Err(e) => {
                        base.signal(TransportSignal::Error(e));
                        break;
                    }
                },
                // ws-level ping/pong is the library's concern, not ours
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    base.signal(TransportSignal::Error(WavelinkError::Transport(
                        e.to_string(),
                    )));
                    break;
                }
            },
        }
    }

    base.set_state(TransportState::Closed);
    base.signal(TransportSignal::Close);
}
