//! wavelink gateway binary.
//!
//! Serves the engine on the configured listen address and runs a trivial
//! echo observer over the connection stream, which doubles as a smoke test
//! for the full handshake / upgrade / heartbeat path.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};
use wavelink_gateway::engine::SessionEvent;
use wavelink_gateway::{build_router, config, Engine, Session};

#[tokio::main]
async fn main() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = match config::load_from_file("wavelink.yaml") {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "config load failed; using defaults");
            config::EngineConfig::default()
        }
    };
    let listen: SocketAddr = cfg
        .listen
        .parse()
        .expect("listen must be a valid SocketAddr");

    let engine = Engine::new(cfg).expect("engine construction failed");
    let mut connections = engine
        .connections()
        .expect("connection stream already taken");
    tokio::spawn(async move {
        while let Some(session) = connections.recv().await {
            tokio::spawn(observe(session));
        }
    });

    let app = build_router(engine);
    tracing::info!(%listen, "wavelink-gateway starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .expect("failed to bind");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server failed");
}

/// Log the session's life and echo messages back.
async fn observe(session: Arc<Session>) {
    let Some(mut events) = session.events() else {
        return;
    };
    let span = tracing::info_span!("session", sid = %session.id(), t = %session.transport_kind().as_str());
    let _enter = span.enter();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Open => {
                tracing::info!(sid = %session.id(), addr = ?session.remote_addr(), "connected");
            }
            SessionEvent::Message(data) => {
                session.send(data);
            }
            SessionEvent::Upgrade(kind) => {
                tracing::info!(sid = %session.id(), to = %kind.as_str(), "upgraded");
            }
            SessionEvent::Close { reason, .. } => {
                tracing::info!(sid = %session.id(), reason = %reason.as_str(), "disconnected");
                break;
            }
            _ => {}
        }
    }
}
