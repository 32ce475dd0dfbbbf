//! Per-client session: state machine, send buffer, heartbeat scheduler,
//! and upgrade coordinator.
//!
//! All mutation goes through the session's own lock; transports never call
//! in directly but emit signals that a pump task (one per transport binding)
//! replays onto the session. Timers are spawned sleeps holding a weak
//! reference, aborted on reset and on close.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use wavelink_core::packet::{Packet, PacketData, PacketType};

use crate::config::EngineConfig;
use crate::engine::events::{CloseReason, SessionEvent};
use crate::engine::EngineShared;
use crate::transport::{SignalRx, Transport, TransportKind, TransportSignal};

/// Session lifecycle. Strictly monotone; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

type Ack = oneshot::Sender<()>;

/// Completion bookkeeping per flushed batch: framed transports drain once
/// per packet, polling drains once per response.
enum SentEntry {
    Single(Option<Ack>),
    Group(Vec<Ack>),
}

struct SessionInner {
    ready: ReadyState,
    transport: Arc<Transport>,
    pump: Option<JoinHandle<()>>,
    upgrading: bool,
    upgraded: bool,
    probe: Option<JoinHandle<()>>,
    candidate: Option<Arc<Transport>>,
    write_buffer: VecDeque<(Packet, Option<Ack>)>,
    sent: VecDeque<SentEntry>,
    ping_interval_timer: Option<JoinHandle<()>>,
    ping_timeout_timer: Option<JoinHandle<()>>,
    /// Graceful close requested while the buffer was non-empty.
    close_pending: bool,
    /// Reason to report when the transport's close signal lands.
    pending_close_reason: Option<CloseReason>,
}

pub struct Session {
    id: String,
    remote_addr: Option<SocketAddr>,
    cfg: Arc<EngineConfig>,
    shared: Weak<EngineShared>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        remote_addr: Option<SocketAddr>,
        cfg: Arc<EngineConfig>,
        shared: Weak<EngineShared>,
        transport: Arc<Transport>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            remote_addr,
            cfg,
            shared,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            inner: Mutex::new(SessionInner {
                ready: ReadyState::Opening,
                transport,
                pump: None,
                upgrading: false,
                upgraded: false,
                probe: None,
                candidate: None,
                write_buffer: VecDeque::new(),
                sent: VecDeque::new(),
                ping_interval_timer: None,
                ping_timeout_timer: None,
                close_pending: false,
                pending_close_reason: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address of the originating request; immutable for the session's life.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn ready_state(&self) -> ReadyState {
        self.lock().ready
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.lock().transport.kind()
    }

    pub fn upgraded(&self) -> bool {
        self.lock().upgraded
    }

    pub fn upgrading(&self) -> bool {
        self.lock().upgrading
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Current transport, if it is the polling variant.
    pub(crate) fn polling_transport(&self) -> Option<Arc<Transport>> {
        let t = self.lock().transport.clone();
        if t.as_polling().is_some() {
            Some(t)
        } else {
            None
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    // ---- binding ---------------------------------------------------------

    /// Install the signal pump for the initially bound transport.
    pub(crate) fn attach(self: &Arc<Self>, signals: SignalRx) {
        let pump = spawn_pump(Arc::downgrade(self), signals);
        self.lock().pump = Some(pump);
    }

    /// Enter the open state: emit the handshake packet (and the configured
    /// initial message), announce openness, and start the heartbeat.
    pub(crate) fn open(self: &Arc<Self>, handshake_json: String) {
        {
            let mut inner = self.lock();
            if inner.ready != ReadyState::Opening {
                return;
            }
            inner.ready = ReadyState::Open;
        }
        self.send_packet(PacketType::Open, PacketData::Text(handshake_json), None);
        if let Some(initial) = self.cfg.initial_packet.clone() {
            self.send_packet(PacketType::Message, PacketData::Text(initial), None);
        }
        self.emit(SessionEvent::Open);
        self.schedule_ping();
        self.arm_ping_timeout(self.cfg.ping_interval() + self.cfg.ping_timeout());
        tracing::debug!(sid = %self.id, transport = %self.transport_kind().as_str(), "session open");
    }

    // ---- sending ---------------------------------------------------------

    /// Enqueue a message. Silently ignored once the session is closing.
    pub fn send(&self, data: impl Into<PacketData>) {
        self.send_packet(PacketType::Message, data.into(), None);
    }

    /// Enqueue a message; the receiver resolves when the packet has been
    /// handed to the wire.
    pub fn send_with_ack(&self, data: impl Into<PacketData>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.send_packet(PacketType::Message, data.into(), Some(tx));
        rx
    }

    fn send_packet(&self, ptype: PacketType, data: PacketData, ack: Option<Ack>) {
        let packet = Packet { ptype, data };
        {
            let mut inner = self.lock();
            if !matches!(inner.ready, ReadyState::Opening | ReadyState::Open) {
                return;
            }
            inner.write_buffer.push_back((packet.clone(), ack));
        }
        self.emit(SessionEvent::PacketCreate(packet));
        self.flush();
    }

    /// Move buffered packets to the transport if it can take them.
    fn flush(&self) {
        let (batch, transport) = {
            let mut inner = self.lock();
            if inner.ready == ReadyState::Closed || inner.write_buffer.is_empty() {
                return;
            }
            let transport = inner.transport.clone();
            if !transport.writable() {
                return;
            }
            let drained: Vec<(Packet, Option<Ack>)> = inner.write_buffer.drain(..).collect();
            let mut batch = Vec::with_capacity(drained.len());
            if transport.supports_framing() {
                for (p, ack) in drained {
                    inner.sent.push_back(SentEntry::Single(ack));
                    batch.push(p);
                }
            } else {
                let mut group = Vec::new();
                for (p, ack) in drained {
                    if let Some(a) = ack {
                        group.push(a);
                    }
                    batch.push(p);
                }
                inner.sent.push_back(SentEntry::Group(group));
            }
            (batch, transport)
        };

        self.emit(SessionEvent::Flush(batch.clone()));
        transport.send(batch);
        self.emit(SessionEvent::Drain);

        let close_now = {
            let inner = self.lock();
            inner.close_pending && inner.write_buffer.is_empty()
        };
        if close_now {
            self.close_transport(CloseReason::ForcedClose);
        }
    }

    /// The transport handed a batch (or one packet) to the wire.
    fn on_drain(&self) {
        let entry = self.lock().sent.pop_front();
        match entry {
            Some(SentEntry::Single(ack)) => {
                if let Some(a) = ack {
                    let _ = a.send(());
                }
            }
            Some(SentEntry::Group(acks)) => {
                for a in acks {
                    let _ = a.send(());
                }
            }
            None => {}
        }
        self.flush();
    }

    // ---- inbound ---------------------------------------------------------

    fn on_packet(self: &Arc<Self>, packet: Packet) {
        if self.lock().ready != ReadyState::Open {
            return;
        }
        // any inbound traffic counts as liveness
        self.arm_ping_timeout(self.cfg.ping_interval() + self.cfg.ping_timeout());

        match packet.ptype {
            PacketType::Ping => {
                self.emit(SessionEvent::Packet(packet.clone()));
                self.emit(SessionEvent::Heartbeat);
                self.send_packet(PacketType::Pong, packet.data, None);
            }
            PacketType::Pong => {
                self.emit(SessionEvent::Packet(packet));
                self.emit(SessionEvent::Heartbeat);
                self.schedule_ping();
            }
            PacketType::Message => {
                self.emit(SessionEvent::Packet(packet.clone()));
                self.emit(SessionEvent::Message(packet.data));
            }
            PacketType::Close => {
                self.emit(SessionEvent::Packet(packet));
                self.on_close(CloseReason::TransportClose, None);
            }
            PacketType::Open => {
                // server-only packet coming back at us
                self.emit(SessionEvent::Packet(packet));
                self.on_close(CloseReason::ClientError, Some("unexpected open packet".into()));
            }
            PacketType::Upgrade | PacketType::Noop => {
                self.emit(SessionEvent::Packet(packet));
            }
        }
    }

    fn on_transport_error(&self, err: wavelink_core::WavelinkError) {
        let reason = match &err {
            wavelink_core::WavelinkError::Parse(_) => CloseReason::ParseError,
            _ => CloseReason::TransportError,
        };
        self.emit(SessionEvent::Error(err.to_string()));
        self.on_close(reason, Some(err.to_string()));
    }

    fn on_transport_close(&self) {
        let reason = self
            .lock()
            .pending_close_reason
            .take()
            .unwrap_or(CloseReason::TransportClose);
        self.on_close(reason, None);
    }

    // ---- closing ---------------------------------------------------------

    /// Graceful shutdown; with `discard` the transport is dropped on the
    /// floor instead of being drained first.
    pub fn close(&self, discard: bool) {
        self.close_with_reason(CloseReason::ForcedClose, discard);
    }

    pub(crate) fn close_with_reason(&self, reason: CloseReason, discard: bool) {
        enum Action {
            Wait,
            CloseTransport,
            Immediate(Arc<Transport>),
        }
        let action = {
            let mut inner = self.lock();
            if inner.ready != ReadyState::Open {
                return;
            }
            inner.ready = ReadyState::Closing;
            if discard {
                Action::Immediate(inner.transport.clone())
            } else if inner.write_buffer.is_empty() {
                Action::CloseTransport
            } else {
                inner.close_pending = true;
                Action::Wait
            }
        };
        match action {
            Action::Wait => {}
            Action::CloseTransport => self.close_transport(reason),
            Action::Immediate(transport) => {
                // discarded transports stay silent, so report the close here
                transport.discard();
                transport.close();
                self.on_close(reason, None);
            }
        }
    }

    fn close_transport(&self, reason: CloseReason) {
        let transport = {
            let mut inner = self.lock();
            inner.close_pending = false;
            inner.pending_close_reason = Some(reason);
            inner.transport.clone()
        };
        transport.close();
    }

    /// Terminal transition. Exactly one close event per session.
    fn on_close(&self, reason: CloseReason, description: Option<String>) {
        let (transport, candidate) = {
            let mut inner = self.lock();
            if inner.ready == ReadyState::Closed {
                return;
            }
            inner.ready = ReadyState::Closed;
            for timer in [
                inner.ping_interval_timer.take(),
                inner.ping_timeout_timer.take(),
                inner.probe.take(),
                inner.pump.take(),
            ]
            .into_iter()
            .flatten()
            {
                timer.abort();
            }
            inner.upgrading = false;
            inner.close_pending = false;
            inner.write_buffer.clear();
            inner.sent.clear();
            (inner.transport.clone(), inner.candidate.take())
        };

        // close before discard so a parked poll still gets the close packet;
        // the pump is already gone, so late signals fall on the floor
        transport.close();
        transport.discard();
        if let Some(c) = candidate {
            c.discard();
            c.close();
        }

        // drop the table entry in the same breath as the state flip
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(&self.id);
        }

        self.emit(SessionEvent::Close {
            reason,
            description,
        });
        tracing::info!(sid = %self.id, reason = %reason.as_str(), "session closed");
    }

    // ---- heartbeat -------------------------------------------------------

    fn schedule_ping(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.cfg.ping_interval();
        let mut inner = self.lock();
        if inner.ready == ReadyState::Closed {
            return;
        }
        if let Some(t) = inner.ping_interval_timer.take() {
            t.abort();
        }
        inner.ping_interval_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(session) = weak.upgrade() {
                session.on_ping_interval();
            }
        }));
    }

    fn on_ping_interval(self: &Arc<Self>) {
        tracing::trace!(sid = %self.id, "sending heartbeat ping");
        self.send_packet(PacketType::Ping, PacketData::none(), None);
        self.arm_ping_timeout(self.cfg.ping_timeout());
    }

    fn arm_ping_timeout(self: &Arc<Self>, after: Duration) {
        let weak = Arc::downgrade(self);
        let mut inner = self.lock();
        if inner.ready == ReadyState::Closed {
            return;
        }
        if let Some(t) = inner.ping_timeout_timer.take() {
            t.abort();
        }
        inner.ping_timeout_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(session) = weak.upgrade() {
                tracing::debug!(sid = %session.id, "heartbeat lost");
                session.on_close(CloseReason::PingTimeout, None);
            }
        }));
    }

    // ---- upgrade ---------------------------------------------------------

    /// Begin probing a candidate transport. Returns false when the session
    /// cannot upgrade (wrong state, already upgrading or upgraded, or the
    /// candidate cannot host an upgrade).
    pub(crate) fn start_upgrade(self: &Arc<Self>, candidate: Arc<Transport>, signals: SignalRx) -> bool {
        {
            let mut inner = self.lock();
            if inner.ready != ReadyState::Open
                || inner.upgrading
                || inner.upgraded
                || !candidate.handles_upgrades()
            {
                return false;
            }
            inner.upgrading = true;
            inner.candidate = Some(candidate.clone());
        }
        tracing::debug!(sid = %self.id, "probing candidate transport");
        let probe = tokio::spawn(run_probe(
            Arc::downgrade(self),
            candidate,
            signals,
            self.cfg.upgrade_timeout(),
        ));
        self.lock().probe = Some(probe);
        true
    }

    /// While a probe is pending, keep releasing the client's parked poll so
    /// it gets a clean window to send the upgrade packet.
    fn prod_parked_poll(&self) {
        let transport = self.lock().transport.clone();
        if transport.kind() == TransportKind::Polling && transport.writable() {
            tracing::trace!(sid = %self.id, "noop to release parked poll");
            transport.send(vec![Packet::noop()]);
        }
    }

    /// Commit: the old transport is discarded and the candidate becomes the
    /// session's transport atomically.
    fn complete_upgrade(self: &Arc<Self>, candidate: Arc<Transport>, signals: SignalRx) {
        let old = {
            let mut inner = self.lock();
            if inner.ready == ReadyState::Closed {
                candidate.close();
                return;
            }
            inner.probe = None;
            inner.candidate = None;
            inner.upgraded = true;
            inner.upgrading = false;
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            if let Some(t) = inner.ping_timeout_timer.take() {
                t.abort();
            }
            let old = std::mem::replace(&mut inner.transport, candidate.clone());
            old.discard();
            inner.pump = Some(spawn_pump(Arc::downgrade(self), signals));
            old
        };
        old.close();

        tracing::info!(sid = %self.id, to = %candidate.kind().as_str(), "transport upgraded");
        self.emit(SessionEvent::Upgrade(candidate.kind()));
        self.schedule_ping();
        self.arm_ping_timeout(self.cfg.ping_interval() + self.cfg.ping_timeout());
        self.flush();

        // the application may have asked to close mid-swap
        let closing = self.lock().ready == ReadyState::Closing;
        if closing {
            self.close_transport(CloseReason::ForcedClose);
        }
    }

    /// Abort: drop the candidate, keep the current transport.
    fn abort_upgrade(&self) {
        let candidate = {
            let mut inner = self.lock();
            if !inner.upgrading {
                return;
            }
            inner.upgrading = false;
            inner.probe = None;
            inner.candidate.take()
        };
        if let Some(c) = candidate {
            c.close();
        }
        tracing::debug!(sid = %self.id, "upgrade aborted; staying on current transport");
    }
}

/// Replay transport signals onto the session until the transport dies.
fn spawn_pump(session: Weak<Session>, mut signals: SignalRx) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            let Some(s) = session.upgrade() else {
                break;
            };
            match signal {
                TransportSignal::Packet(p) => s.on_packet(p),
                TransportSignal::Drain => s.on_drain(),
                TransportSignal::Error(e) => {
                    s.on_transport_error(e);
                    break;
                }
                TransportSignal::Close => {
                    s.on_transport_close();
                    break;
                }
            }
        }
    })
}

enum ProbeOutcome {
    Commit,
    Abort,
}

/// Watch a candidate transport through the probe handshake.
async fn run_probe(
    session: Weak<Session>,
    candidate: Arc<Transport>,
    mut signals: SignalRx,
    upgrade_timeout: Duration,
) {
    let deadline = tokio::time::sleep(upgrade_timeout);
    tokio::pin!(deadline);
    let mut poll_prod = tokio::time::interval(Duration::from_millis(100));
    let mut probe_seen = false;
    let mut outcome = ProbeOutcome::Abort;

    loop {
        tokio::select! {
            () = &mut deadline => {
                tracing::debug!("upgrade timed out");
                break;
            }
            _ = poll_prod.tick(), if probe_seen => {
                match session.upgrade() {
                    Some(s) => s.prod_parked_poll(),
                    None => break,
                }
            }
            signal = signals.recv() => match signal {
                Some(TransportSignal::Packet(p)) => {
                    if p.ptype == PacketType::Ping && p.is_probe() {
                        candidate.send(vec![Packet::pong("probe")]);
                        probe_seen = true;
                        if let Some(s) = session.upgrade() {
                            s.emit(SessionEvent::Upgrading(candidate.kind()));
                        } else {
                            break;
                        }
                    } else if p.ptype == PacketType::Upgrade && probe_seen {
                        outcome = ProbeOutcome::Commit;
                        break;
                    } else {
                        tracing::debug!(ptype = %p.ptype.as_str(), "unexpected packet during probe");
                        break;
                    }
                }
                Some(TransportSignal::Drain) => {}
                Some(TransportSignal::Error(_)) | Some(TransportSignal::Close) | None => break,
            }
        }
    }

    let Some(s) = session.upgrade() else {
        candidate.close();
        return;
    };
    match outcome {
        ProbeOutcome::Commit => s.complete_upgrade(candidate, signals),
        ProbeOutcome::Abort => s.abort_upgrade(),
    }
}
