//! WebSocket handshake, upgrade, and heartbeat scenarios against a live
//! listener. Polling legs go through the router directly; both paths share
//! the same engine state.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;
use wavelink_core::codec::decode_payload;
use wavelink_core::packet::{Handshake, Packet, PacketType};
use wavelink_gateway::config::EngineConfig;
use wavelink_gateway::engine::{CloseReason, ReadyState, SessionEvent};
use wavelink_gateway::transport::TransportKind;
use wavelink_gateway::{build_router, Engine, Session};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    engine: Engine,
    router: Router,
    connections: mpsc::UnboundedReceiver<Arc<Session>>,
    addr: SocketAddr,
}

async fn serve(cfg: EngineConfig) -> Server {
    let engine = Engine::new(cfg).unwrap();
    let connections = engine.connections().unwrap();
    let router = build_router(engine.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router.clone();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    Server {
        engine,
        router,
        connections,
        addr,
    }
}

fn quiet_cfg() -> EngineConfig {
    EngineConfig {
        ping_interval_ms: 10_000,
        ping_timeout_ms: 5_000,
        ..EngineConfig::default()
    }
}

fn ws_url(addr: SocketAddr, extra: &str) -> String {
    format!("ws://{addr}/engine.io/?EIO=3&transport=websocket{extra}")
}

async fn connect(addr: SocketAddr, extra: &str) -> Ws {
    let (ws, _response) = connect_async(ws_url(addr, extra)).await.unwrap();
    ws
}

async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("ws read timed out")
            .expect("ws stream ended")
            .expect("ws error");
        match msg {
            Message::Text(s) => return s,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_binary(ws: &mut Ws) -> Vec<u8> {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("ws read timed out")
            .expect("ws stream ended")
            .expect("ws error");
        match msg {
            Message::Binary(b) => return b,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Drain frames until the peer closes; returns the text frames seen.
async fn read_until_close(ws: &mut Ws) -> Vec<String> {
    let mut texts = Vec::new();
    loop {
        match timeout(Duration::from_secs(3), ws.next()).await {
            Ok(Some(Ok(Message::Text(s)))) => texts.push(s),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return texts,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("peer never closed; saw {texts:?}"),
        }
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream ended")
}

async fn wait_for_close(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> CloseReason {
    loop {
        if let SessionEvent::Close { reason, .. } = next_event(events).await {
            return reason;
        }
    }
}

async fn polling_handshake(router: &Router) -> Handshake {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/engine.io/?EIO=3&transport=polling")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let packets = decode_payload(std::str::from_utf8(&body).unwrap()).unwrap();
    assert_eq!(packets[0].ptype, PacketType::Open);
    serde_json::from_str(packets[0].data.as_text().unwrap()).unwrap()
}

async fn poll(router: &Router, sid: &str) -> Vec<Packet> {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/engine.io/?EIO=3&transport=polling&sid={sid}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    decode_payload(std::str::from_utf8(&body).unwrap()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_websocket_handshake() {
    let mut server = serve(quiet_cfg()).await;
    let mut ws = connect(server.addr, "").await;

    let open = next_text(&mut ws).await;
    assert!(open.starts_with('0'), "first frame was {open:?}");
    let hs: Handshake = serde_json::from_str(&open[1..]).unwrap();
    assert!(!hs.sid.is_empty());
    assert!(hs.upgrades.is_empty());
    assert_eq!(hs.ping_interval, 10_000);

    let session = server.connections.recv().await.unwrap();
    assert_eq!(session.transport_kind(), TransportKind::WebSocket);
    assert!(!session.upgraded());
    assert_eq!(server.engine.clients_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_message_round_trip() {
    let mut server = serve(quiet_cfg()).await;
    let mut ws = connect(server.addr, "").await;
    let _open = next_text(&mut ws).await;
    let session = server.connections.recv().await.unwrap();
    let mut events = session.events().unwrap();

    ws.send(Message::Text("4hello".into())).await.unwrap();
    loop {
        if let SessionEvent::Message(data) = next_event(&mut events).await {
            assert_eq!(data.as_text(), Some("hello"));
            break;
        }
    }

    session.send("world");
    assert_eq!(next_text(&mut ws).await, "4world");
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_binary_frames() {
    let mut server = serve(quiet_cfg()).await;
    let mut ws = connect(server.addr, "").await;
    let _open = next_text(&mut ws).await;
    let session = server.connections.recv().await.unwrap();
    let mut events = session.events().unwrap();

    ws.send(Message::Binary(vec![4, 1, 2, 3])).await.unwrap();
    loop {
        if let SessionEvent::Message(data) = next_event(&mut events).await {
            assert_eq!(data, bytes::Bytes::from_static(&[1, 2, 3]).into());
            break;
        }
    }

    session.send(vec![9u8, 8, 7]);
    assert_eq!(next_binary(&mut ws).await, vec![4, 9, 8, 7]);
}

#[tokio::test(flavor = "multi_thread")]
async fn b64_flag_disables_binary_frames() {
    let mut server = serve(quiet_cfg()).await;
    let mut ws = connect(server.addr, "&b64=1").await;
    let _open = next_text(&mut ws).await;
    let session = server.connections.recv().await.unwrap();

    session.send(vec![0xffu8, 0x00]);
    let frame = next_text(&mut ws).await;
    assert!(frame.starts_with("b4"), "frame was {frame:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn polling_session_upgrades_without_losing_packets() {
    let cfg = EngineConfig {
        upgrade_timeout_ms: 5_000,
        ..quiet_cfg()
    };
    let mut server = serve(cfg).await;
    let hs = polling_handshake(&server.router).await;
    let session = server.connections.recv().await.unwrap();
    let mut events = session.events().unwrap();

    // park a poll so the probe phase has something to release
    let router = server.router.clone();
    let sid = hs.sid.clone();
    let parked = tokio::spawn(async move { poll(&router, &sid).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut ws = connect(server.addr, &format!("&sid={}", hs.sid)).await;
    ws.send(Message::Text("2probe".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "3probe");

    // the parked poll is prodded free with a noop
    let released = parked.await.unwrap();
    assert!(
        released.contains(&Packet::noop()),
        "poll got {released:?} instead of a noop"
    );

    // packets accepted mid-upgrade must survive the swap
    session.send("queued");

    ws.send(Message::Text("5".into())).await.unwrap();
    loop {
        match next_event(&mut events).await {
            SessionEvent::Upgrade(kind) => {
                assert_eq!(kind, TransportKind::WebSocket);
                break;
            }
            SessionEvent::Close { reason, .. } => panic!("unexpected close: {reason:?}"),
            _ => {}
        }
    }
    assert!(session.upgraded());
    assert_eq!(session.transport_kind(), TransportKind::WebSocket);

    // exactly once, on the new transport
    assert_eq!(next_text(&mut ws).await, "4queued");

    ws.send(Message::Text("4after-upgrade".into())).await.unwrap();
    loop {
        if let SessionEvent::Message(data) = next_event(&mut events).await {
            assert_eq!(data.as_text(), Some("after-upgrade"));
            break;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn upgrade_timeout_keeps_the_polling_session() {
    let cfg = EngineConfig {
        upgrade_timeout_ms: 300,
        ..quiet_cfg()
    };
    let mut server = serve(cfg).await;
    let hs = polling_handshake(&server.router).await;
    let session = server.connections.recv().await.unwrap();

    let mut ws = connect(server.addr, &format!("&sid={}", hs.sid)).await;
    ws.send(Message::Text("2probe".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "3probe");

    // never send the upgrade packet; the candidate gets closed
    let _frames = read_until_close(&mut ws).await;

    assert_eq!(session.ready_state(), ReadyState::Open);
    assert!(!session.upgraded());
    assert!(!session.upgrading());
    assert_eq!(server.engine.clients_count(), 1);

    // the original transport still serves
    session.send("still-alive");
    let packets = poll(&server.router, &hs.sid).await;
    assert_eq!(packets, vec![Packet::message("still-alive")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_timeout_closes_the_session() {
    let cfg = EngineConfig {
        ping_interval_ms: 300,
        ping_timeout_ms: 300,
        ..EngineConfig::default()
    };
    let mut server = serve(cfg).await;
    let mut ws = connect(server.addr, "").await;
    let _open = next_text(&mut ws).await;
    let session = server.connections.recv().await.unwrap();
    let mut events = session.events().unwrap();

    // the server pings; we stay silent
    assert_eq!(next_text(&mut ws).await, "2");
    let reason = wait_for_close(&mut events).await;
    assert_eq!(reason, CloseReason::PingTimeout);
    assert_eq!(server.engine.clients_count(), 0);
    let _ = read_until_close(&mut ws).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pong_keeps_the_session_alive() {
    let cfg = EngineConfig {
        ping_interval_ms: 200,
        ping_timeout_ms: 200,
        ..EngineConfig::default()
    };
    let mut server = serve(cfg).await;
    let mut ws = connect(server.addr, "").await;
    let _open = next_text(&mut ws).await;
    let session = server.connections.recv().await.unwrap();

    // answer three heartbeat rounds, then confirm we are still open
    for _ in 0..3 {
        assert_eq!(next_text(&mut ws).await, "2");
        ws.send(Message::Text("3".into())).await.unwrap();
    }
    assert_eq!(session.ready_state(), ReadyState::Open);
    assert_eq!(server.engine.clients_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn upgrade_with_unknown_sid_is_rejected() {
    let server = serve(quiet_cfg()).await;
    let err = connect_async(ws_url(server.addr, "&sid=does-not-exist"))
        .await
        .expect_err("connect must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_sends_pending_then_close_packet() {
    let mut server = serve(quiet_cfg()).await;
    let mut ws = connect(server.addr, "").await;
    let _open = next_text(&mut ws).await;
    let session = server.connections.recv().await.unwrap();
    let mut events = session.events().unwrap();

    let ack = session.send_with_ack("A");
    session.close(false);

    assert_eq!(next_text(&mut ws).await, "4A");
    let trailing = read_until_close(&mut ws).await;
    assert_eq!(trailing, vec!["1".to_owned()]);

    ack.await.expect("ack should fire");
    let reason = wait_for_close(&mut events).await;
    assert_eq!(reason, CloseReason::ForcedClose);
    assert_eq!(server.engine.clients_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn client_going_away_reports_transport_close() {
    let mut server = serve(quiet_cfg()).await;
    let mut ws = connect(server.addr, "").await;
    let _open = next_text(&mut ws).await;
    let session = server.connections.recv().await.unwrap();
    let mut events = session.events().unwrap();

    ws.close(None).await.unwrap();
    let reason = wait_for_close(&mut events).await;
    assert_eq!(reason, CloseReason::TransportClose);
    assert_eq!(server.engine.clients_count(), 0);
}
