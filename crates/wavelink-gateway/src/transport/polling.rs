//! Long-polling transport.
//!
//! Outbound traffic rides on a parked GET: the response is withheld until a
//! flush hands it a batch (or the keep-alive window lapses and a `noop` is
//! returned so the client re-polls). Inbound traffic arrives as POST bodies
//! in the concatenated payload encoding.
//!
//! Concurrency contract per session: at most one parked GET and at most one
//! POST in flight. Overlap is a protocol error answered with 400; the
//! session itself stays usable on the original request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use wavelink_core::codec;
use wavelink_core::error::{Result, WavelinkError};
use wavelink_core::packet::Packet;

use super::{SignalTx, TransportBase, TransportSignal, TransportState};

/// Body of one polling response, always in the text payload encoding.
#[derive(Debug)]
pub struct PollBody {
    pub payload: String,
}

impl PollBody {
    fn from_packets(packets: &[Packet]) -> Self {
        Self {
            payload: codec::encode_payload(packets),
        }
    }

    /// Fallback body for an expired or orphaned poll.
    pub fn noop() -> Self {
        Self::from_packets(&[Packet::noop()])
    }

    /// Body telling the client the session is gone.
    pub fn closed() -> Self {
        Self::from_packets(&[Packet::close()])
    }
}

#[derive(Debug, Default)]
struct PollingInner {
    /// The parked GET, if any. `writable` is defined as "this is Some".
    poll: Option<oneshot::Sender<PollBody>>,
    /// Packets accepted while no GET was parked.
    pending: Vec<Packet>,
}

#[derive(Debug)]
pub struct PollingTransport {
    base: TransportBase,
    inner: Mutex<PollingInner>,
    data_in_flight: AtomicBool,
}

impl PollingTransport {
    pub fn new(signals: SignalTx, supports_binary: bool) -> Self {
        Self {
            base: TransportBase::new(signals, supports_binary),
            inner: Mutex::new(PollingInner::default()),
            data_in_flight: AtomicBool::new(false),
        }
    }

    pub fn base(&self) -> &TransportBase {
        &self.base
    }

    pub fn writable(&self) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.poll.is_some(),
            Err(_) => false,
        }
    }

    /// Attach a new GET. Returns the receiver the handler awaits; resolves
    /// on the next flush. A second GET while one is parked is an overlap.
    pub fn on_poll_request(&self) -> Result<oneshot::Receiver<PollBody>> {
        if self.base.state() == TransportState::Closed {
            return Err(WavelinkError::Transport("transport closed".into()));
        }
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| WavelinkError::Internal("polling state poisoned".into()))?;
        if inner.poll.is_some() {
            return Err(WavelinkError::bad_request());
        }

        let (tx, rx) = oneshot::channel();
        if inner.pending.is_empty() {
            inner.poll = Some(tx);
        } else {
            let batch: Vec<Packet> = inner.pending.drain(..).collect();
            let _ = tx.send(PollBody::from_packets(&batch));
        }
        drop(inner);

        // writable flipped true (or a batch was just handed off): either way
        // the session gets one drain to fire callbacks and re-flush.
        self.base.signal(TransportSignal::Drain);
        Ok(rx)
    }

    /// Clear a parked poll whose keep-alive window lapsed. Returns the
    /// `noop` body to answer it with, or `None` if a flush won the race.
    pub fn expire_poll(&self) -> Option<PollBody> {
        let mut inner = self.inner.lock().ok()?;
        inner.poll.take().map(|_abandoned| PollBody::noop())
    }

    pub fn send(&self, packets: Vec<Packet>) {
        if self.base.discarded() || self.base.state() == TransportState::Closed {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.poll.take() {
            Some(tx) => {
                let mut batch: Vec<Packet> = inner.pending.drain(..).collect();
                batch.extend(packets);
                let _ = tx.send(PollBody::from_packets(&batch));
                drop(inner);
                self.base.signal(TransportSignal::Drain);
            }
            None => inner.pending.extend(packets),
        }
    }

    /// Guard the single-POST-in-flight invariant.
    pub fn begin_data(&self) -> Result<DataGuard<'_>> {
        if self
            .data_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WavelinkError::bad_request());
        }
        Ok(DataGuard(&self.data_in_flight))
    }

    /// Report a fault the router detected before decode could start.
    pub fn fail(&self, err: WavelinkError) {
        self.base.signal(TransportSignal::Error(err));
        self.base.signal(TransportSignal::Close);
    }

    /// Decode one POST body and surface its packets. Faults are signaled to
    /// the session (which closes) and also returned for the HTTP response.
    pub fn ingest(&self, body: &str, max_size: usize) -> Result<()> {
        if self.base.state() == TransportState::Closed {
            return Err(WavelinkError::Transport("transport closed".into()));
        }
        if body.len() > max_size {
            self.base
                .signal(TransportSignal::Error(WavelinkError::PayloadTooLarge));
            self.base.signal(TransportSignal::Close);
            return Err(WavelinkError::PayloadTooLarge);
        }
        let packets = match codec::decode_payload(body) {
            Ok(packets) => packets,
            Err(e) => {
                self.base.signal(TransportSignal::Error(e));
                self.base.signal(TransportSignal::Close);
                return Err(WavelinkError::bad_request());
            }
        };
        for p in packets {
            self.base.signal(TransportSignal::Packet(p));
        }
        Ok(())
    }

    pub fn close(&self) {
        if self.base.state() == TransportState::Closed {
            return;
        }
        self.base.set_state(TransportState::Closed);
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(tx) = inner.poll.take() {
                // superseded transports dispose silently; a real close tells
                // the client the session is over
                let body = if self.base.discarded() {
                    PollBody::noop()
                } else {
                    PollBody::closed()
                };
                let _ = tx.send(body);
            }
            inner.pending.clear();
        }
        self.base.signal(TransportSignal::Close);
    }
}

/// RAII guard for the POST-in-flight flag.
#[derive(Debug)]
pub struct DataGuard<'a>(&'a AtomicBool);

impl Drop for DataGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
