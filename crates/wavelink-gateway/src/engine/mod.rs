//! Engine runtime: session table, request verification, handshake, and the
//! upgrade dispatcher.
//!
//! The engine is the only process-wide mutable structure; everything else
//! hangs off a session. It is cheap to clone and shared as axum state.

pub mod events;
mod session;

pub use events::{CloseReason, SessionEvent};
pub use session::{ReadyState, Session};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::WebSocket;
use axum::http::{header, HeaderMap, Method};
use dashmap::DashMap;
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use wavelink_core::codec;
use wavelink_core::error::{ProtocolCode, Result, WavelinkError};
use wavelink_core::packet::Handshake;

use crate::config::EngineConfig;
use crate::transport::{
    run_ws_socket, PollBody, PollingTransport, Transport, TransportKind, WsTransport,
};

/// Recognized query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineQuery {
    /// Protocol revision; informational on the server side.
    #[serde(rename = "EIO", default)]
    pub eio: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    /// "1" forces base64 framing (no binary frames).
    #[serde(default)]
    pub b64: Option<String>,
    /// JSONP callback index; presence selects the JSONP polling variant.
    #[serde(default)]
    pub j: Option<String>,
    /// Client cache-buster; ignored.
    #[serde(default)]
    pub t: Option<String>,
}

impl EngineQuery {
    pub fn supports_binary(&self) -> bool {
        self.b64.as_deref() != Some("1")
    }
}

/// A request rejection with its stable wire shape.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub code: u8,
    pub message: String,
    pub status: u16,
}

impl From<ProtocolCode> for Rejection {
    fn from(code: ProtocolCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_owned(),
            status: code.http_status(),
        }
    }
}

impl From<WavelinkError> for Rejection {
    fn from(err: WavelinkError) -> Self {
        match err.protocol_code() {
            Some(code) => code.into(),
            None => ProtocolCode::BadRequest.into(),
        }
    }
}

/// What the admission hook sees for a handshake request.
pub struct AdmissionRequest<'a> {
    pub query: &'a EngineQuery,
    pub headers: &'a HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

/// Caller-chosen rejection from the admission hook; surfaced as HTTP 403.
#[derive(Debug, Clone)]
pub struct AdmissionDenial {
    pub code: u8,
    pub message: String,
}

impl From<AdmissionDenial> for Rejection {
    fn from(d: AdmissionDenial) -> Self {
        Self {
            code: d.code,
            message: d.message,
            status: 403,
        }
    }
}

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;
type AllowRequest =
    Box<dyn Fn(&AdmissionRequest<'_>) -> std::result::Result<(), AdmissionDenial> + Send + Sync>;

/// Client table shared with sessions, so a closing session can deregister
/// itself in the same breath as its state flip.
pub struct EngineShared {
    clients: DashMap<String, Arc<Session>>,
    count: AtomicUsize,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            clients: DashMap::new(),
            count: AtomicUsize::new(0),
        }
    }

    fn insert(&self, sid: String, session: Arc<Session>) {
        self.clients.insert(sid, session);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn remove(&self, sid: &str) {
        if self.clients.remove(sid).is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

struct EngineInner {
    cfg: Arc<EngineConfig>,
    shared: Arc<EngineShared>,
    generate_id: IdGenerator,
    allow_request: Option<AllowRequest>,
    conn_tx: mpsc::UnboundedSender<Arc<Session>>,
    conn_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Session>>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Staged construction: config plus the overridable hooks.
pub struct EngineBuilder {
    cfg: EngineConfig,
    generate_id: Option<IdGenerator>,
    allow_request: Option<AllowRequest>,
}

impl EngineBuilder {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            generate_id: None,
            allow_request: None,
        }
    }

    /// Override sid generation (deterministic ids for tests).
    pub fn id_generator(mut self, f: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.generate_id = Some(Box::new(f));
        self
    }

    /// Custom admission for handshakes.
    pub fn allow_request(
        mut self,
        f: impl Fn(&AdmissionRequest<'_>) -> std::result::Result<(), AdmissionDenial>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.allow_request = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.cfg.validate()?;
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        Ok(Engine {
            inner: Arc::new(EngineInner {
                cfg: Arc::new(self.cfg),
                shared: Arc::new(EngineShared::new()),
                generate_id: self.generate_id.unwrap_or_else(|| Box::new(default_sid)),
                allow_request: self.allow_request,
                conn_tx,
                conn_rx: Mutex::new(Some(conn_rx)),
            }),
        })
    }
}

/// 16 random bytes, URL-safe base64.
fn default_sid() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    codec::base64_url(&bytes)
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        EngineBuilder::new(cfg).build()
    }

    pub fn cfg(&self) -> &EngineConfig {
        &self.inner.cfg
    }

    /// Stream of freshly handshaken sessions. Yields `None` after the first
    /// call.
    pub fn connections(&self) -> Option<mpsc::UnboundedReceiver<Arc<Session>>> {
        self.inner
            .conn_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
    }

    pub fn session(&self, sid: &str) -> Option<Arc<Session>> {
        self.inner
            .shared
            .clients
            .get(sid)
            .map(|r| r.value().clone())
    }

    pub fn clients_count(&self) -> usize {
        self.inner.shared.count.load(Ordering::Acquire)
    }

    /// Close every session ("server close") and discard their transports.
    pub fn close(&self) {
        tracing::info!("engine shutting down; closing all sessions");
        let sessions: Vec<Arc<Session>> = self
            .inner
            .shared
            .clients
            .iter()
            .map(|r| r.value().clone())
            .collect();
        for session in sessions {
            session.close_with_reason(CloseReason::ServerClose, true);
        }
    }

    /// Admission rules, applied in order: transport, Origin header, sid
    /// liveness and transport match, handshake method plus the custom hook.
    pub(crate) fn verify(
        &self,
        query: &EngineQuery,
        headers: &HeaderMap,
        method: &Method,
        upgrade: bool,
        remote_addr: Option<SocketAddr>,
    ) -> std::result::Result<Option<Arc<Session>>, Rejection> {
        let kind = query
            .transport
            .as_deref()
            .and_then(TransportKind::parse)
            .filter(|k| self.inner.cfg.transport_enabled(*k))
            .ok_or(ProtocolCode::UnknownTransport)?;

        if let Some(origin) = headers.get(header::ORIGIN) {
            let ok = origin
                .as_bytes()
                .iter()
                .all(|&b| b == b'\t' || (0x20..0x7f).contains(&b) || b >= 0x80);
            if !ok {
                return Err(ProtocolCode::BadRequest.into());
            }
        }

        if let Some(sid) = &query.sid {
            let session = self.session(sid).ok_or(ProtocolCode::UnknownSid)?;
            if !upgrade && session.transport_kind() != kind {
                return Err(ProtocolCode::BadRequest.into());
            }
            return Ok(Some(session));
        }

        if *method != Method::GET {
            return Err(ProtocolCode::BadHandshakeMethod.into());
        }
        if let Some(allow) = &self.inner.allow_request {
            allow(&AdmissionRequest {
                query,
                headers,
                remote_addr,
            })
            .map_err(Rejection::from)?;
        }
        Ok(None)
    }

    fn generate_sid(&self) -> String {
        for _ in 0..16 {
            let sid = (self.inner.generate_id)();
            if !self.inner.shared.clients.contains_key(&sid) {
                return sid;
            }
        }
        // a stuck custom generator must not wedge the handshake path
        loop {
            let sid = default_sid();
            if !self.inner.shared.clients.contains_key(&sid) {
                return sid;
            }
        }
    }

    fn handshake_payload(&self, sid: &str, kind: TransportKind) -> Result<String> {
        let cfg = &self.inner.cfg;
        let handshake = Handshake {
            sid: sid.to_owned(),
            upgrades: cfg.upgrades_from(kind),
            ping_interval: cfg.ping_interval_ms,
            ping_timeout: cfg.ping_timeout_ms,
        };
        serde_json::to_string(&handshake)
            .map_err(|e| WavelinkError::Internal(format!("handshake encode: {e}")))
    }

    /// Polling handshake: build the session on a fresh polling transport and
    /// park the handshake GET as its first poll.
    pub(crate) fn handshake_polling(
        &self,
        query: &EngineQuery,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(Arc<Session>, oneshot::Receiver<PollBody>)> {
        let sid = self.generate_sid();
        let payload = self.handshake_payload(&sid, TransportKind::Polling)?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Transport::Polling(PollingTransport::new(
            signal_tx,
            query.supports_binary(),
        )));
        let session = Session::new(
            sid.clone(),
            remote_addr,
            Arc::clone(&self.inner.cfg),
            Arc::downgrade(&self.inner.shared),
            Arc::clone(&transport),
        );
        self.inner.shared.insert(sid.clone(), Arc::clone(&session));
        session.attach(signal_rx);
        session.open(payload);

        let poll = match transport.as_polling() {
            Some(p) => p.on_poll_request()?,
            None => return Err(WavelinkError::Internal("not a polling transport".into())),
        };
        tracing::info!(sid = %sid, transport = "polling", "session handshake");
        let _ = self.inner.conn_tx.send(Arc::clone(&session));
        Ok((session, poll))
    }

    /// Entry point for an upgraded WebSocket connection. With a sid this is
    /// an upgrade attempt on an existing session; without one it is a direct
    /// WebSocket handshake. Runs until the socket dies.
    pub(crate) async fn on_websocket(
        &self,
        query: EngineQuery,
        socket: WebSocket,
        remote_addr: Option<SocketAddr>,
    ) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (ws, out_rx) = WsTransport::new(signal_tx, query.supports_binary());
        let transport = Arc::new(Transport::WebSocket(ws));

        if let Some(sid) = &query.sid {
            // session may have died between verify and upgrade completion
            let Some(session) = self.session(sid) else {
                tracing::debug!(sid = %sid, "upgrade socket for a dead session");
                return;
            };
            if !self.inner.cfg.allow_upgrades
                || !session.start_upgrade(Arc::clone(&transport), signal_rx)
            {
                tracing::debug!(sid = %sid, "upgrade rejected");
                return;
            }
            run_ws_socket(socket, transport, out_rx).await;
            return;
        }

        let sid = self.generate_sid();
        let payload = match self.handshake_payload(&sid, TransportKind::WebSocket) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "handshake payload failed");
                return;
            }
        };
        let session = Session::new(
            sid.clone(),
            remote_addr,
            Arc::clone(&self.inner.cfg),
            Arc::downgrade(&self.inner.shared),
            Arc::clone(&transport),
        );
        self.inner.shared.insert(sid.clone(), Arc::clone(&session));
        session.attach(signal_rx);
        session.open(payload);
        tracing::info!(sid = %sid, transport = "websocket", "session handshake");
        let _ = self.inner.conn_tx.send(Arc::clone(&session));

        run_ws_socket(socket, transport, out_rx).await;
    }
}
