//! Axum wiring (HTTP polling + HTTP -> WS upgrade).
//!
//! One GET handler serves both worlds, split on the `transport` query value:
//! WebSocket requests are upgraded and handed to the engine, polling requests
//! park until the session flushes. POST carries inbound polling payloads.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{connect_info::ConnectInfo, ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::oneshot;
use tower_http::compression::predicate::SizeAbove;
use tower_http::compression::CompressionLayer;
use wavelink_core::{ProtocolCode, WavelinkError};

use crate::engine::{Engine, EngineQuery, Rejection};
use crate::transport::{PollBody, PollingTransport, TransportKind};

pub fn build_router(engine: Engine) -> Router {
    let cfg = engine.cfg();
    let path = cfg.path.clone();
    let compression = cfg.http_compression.clone();

    let router = Router::new()
        .route(&path, get(handle_get).post(handle_post))
        .with_state(engine);

    if compression.enabled {
        let threshold = u16::try_from(compression.threshold).unwrap_or(u16::MAX);
        router.layer(CompressionLayer::new().compress_when(SizeAbove::new(threshold)))
    } else {
        router
    }
}

async fn handle_get(
    State(engine): State<Engine>,
    Query(query): Query<EngineQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let remote_addr = connect_info.map(|ci| ci.0);
    if let Some(eio) = &query.eio {
        tracing::debug!(eio = %eio, "protocol revision");
    }

    let wants_ws = query.transport.as_deref() == Some(TransportKind::WebSocket.as_str());
    let upgrade = wants_ws && ws.is_some();

    let session = match engine.verify(&query, &headers, &Method::GET, upgrade, remote_addr) {
        Ok(session) => session,
        Err(rejection) => return rejection_response(&rejection),
    };

    if wants_ws {
        let Some(ws) = ws else {
            // websocket transport without an actual upgrade request
            return rejection_response(&ProtocolCode::BadRequest.into());
        };
        return ws.on_upgrade(move |socket| async move {
            engine.on_websocket(query, socket, remote_addr).await;
        });
    }

    let keepalive = engine.cfg().ping_interval() + engine.cfg().ping_timeout();
    match session {
        Some(session) => {
            let Some(transport) = session.polling_transport() else {
                return rejection_response(&ProtocolCode::BadRequest.into());
            };
            let Some(polling) = transport.as_polling() else {
                return rejection_response(&ProtocolCode::BadRequest.into());
            };
            let poll = match polling.on_poll_request() {
                Ok(poll) => poll,
                Err(e) => return rejection_response(&e.into()),
            };
            let body = wait_poll(polling, poll, keepalive).await;
            poll_response(body, &query)
        }
        None => match engine.handshake_polling(&query, remote_addr) {
            Ok((session, poll)) => {
                let Some(transport) = session.polling_transport() else {
                    return rejection_response(&ProtocolCode::BadRequest.into());
                };
                let body = match transport.as_polling() {
                    Some(polling) => wait_poll(polling, poll, keepalive).await,
                    None => PollBody::closed(),
                };
                let mut response = poll_response(body, &query);
                let cookie = &engine.cfg().cookie;
                if cookie.enabled {
                    if let Ok(value) = cookie.header_value(session.id()).parse() {
                        response.headers_mut().insert(header::SET_COOKIE, value);
                    }
                }
                response
            }
            Err(e) => rejection_response(&e.into()),
        },
    }
}

#[derive(Debug, Deserialize)]
struct JsonpBody {
    d: String,
}

async fn handle_post(
    State(engine): State<Engine>,
    Query(query): Query<EngineQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session = match engine.verify(&query, &headers, &Method::POST, false, None) {
        Ok(Some(session)) => session,
        // no sid on a POST is rejected by verify; this arm is unreachable
        Ok(None) => return rejection_response(&ProtocolCode::BadHandshakeMethod.into()),
        Err(rejection) => return rejection_response(&rejection),
    };

    let Some(transport) = session.polling_transport() else {
        return rejection_response(&ProtocolCode::BadRequest.into());
    };
    let Some(polling) = transport.as_polling() else {
        return rejection_response(&ProtocolCode::BadRequest.into());
    };

    let _guard = match polling.begin_data() {
        Ok(guard) => guard,
        Err(e) => return rejection_response(&e.into()),
    };

    let text = if query.j.is_some() {
        match serde_urlencoded::from_bytes::<JsonpBody>(&body) {
            Ok(form) => form.d,
            Err(_) => return rejection_response(&ProtocolCode::BadRequest.into()),
        }
    } else {
        match std::str::from_utf8(&body) {
            Ok(s) => s.to_owned(),
            Err(_) => {
                polling.fail(WavelinkError::Parse("body is not valid utf-8".into()));
                return rejection_response(&ProtocolCode::BadRequest.into());
            }
        }
    };

    match polling.ingest(&text, engine.cfg().max_http_buffer_size) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            "ok",
        )
            .into_response(),
        Err(e) => rejection_response(&e.into()),
    }
}

/// Await the parked poll; on keep-alive expiry answer `noop` so the client
/// re-polls promptly.
async fn wait_poll(
    polling: &PollingTransport,
    mut poll: oneshot::Receiver<PollBody>,
    keepalive: Duration,
) -> PollBody {
    match tokio::time::timeout(keepalive, &mut poll).await {
        Ok(Ok(body)) => body,
        // transport dropped without answering: the session is gone
        Ok(Err(_)) => PollBody::closed(),
        Err(_elapsed) => match polling.expire_poll() {
            Some(body) => body,
            // a flush won the race against the keep-alive timer
            None => poll.try_recv().ok().unwrap_or_else(PollBody::noop),
        },
    }
}

fn poll_response(body: PollBody, query: &EngineQuery) -> Response {
    match &query.j {
        Some(j) => {
            let index: String = j.chars().filter(|c| c.is_ascii_digit()).collect();
            let script = format!("___eio[{}](\"{}\");", index, escape_jsonp(&body.payload));
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/javascript; charset=UTF-8")],
                script,
            )
                .into_response()
        }
        None => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
            body.payload,
        )
            .into_response(),
    }
}

fn escape_jsonp(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    for c in payload.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            _ => out.push(c),
        }
    }
    out
}

fn rejection_response(rejection: &Rejection) -> Response {
    let body = serde_json::json!({
        "code": rejection.code,
        "message": rejection.message,
    })
    .to_string();
    (
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::BAD_REQUEST),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn jsonp_escaping() {
        assert_eq!(escape_jsonp("6:4plain"), "6:4plain");
        assert_eq!(escape_jsonp("say \"hi\"\n"), "say \\\"hi\\\"\\n");
        assert_eq!(escape_jsonp("back\\slash"), "back\\\\slash");
    }
}
