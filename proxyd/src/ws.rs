//! WebSocket proxy bridge (C8): upgrades an inbound client connection,
//! authenticates it the same way the HTTP path does, opens (or reuses) a
//! backend connection for the lifetime of the client socket, and bridges
//! frames in both directions.
//!
//! Grounded in the teacher's `eth_subscribe` handling in `app.rs` (spawn a
//! task per direction, `AbortHandle` the pair together) generalized from a
//! single always-on subscription forwarder into a full bidirectional proxy,
//! since the spec's WS surface is the whole JSON-RPC method space, not just
//! subscriptions.

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum_client_ip::ClientIp;
use futures::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, warn};

use crate::app::App;
use crate::auth::AuthOutcome;
use crate::errors::ProxydError;
use crate::rpcs::backend::Backend;

/// Frame length, in bytes, beyond which a client->backend frame is dropped
/// and the connection closed rather than forwarded. Reuses the HTTP body
/// cap since a single WS frame is semantically one JSON-RPC payload, same
/// as one HTTP request body.
fn frame_too_large(msg: &AxumMessage, max_body_bytes: usize) -> bool {
    let len = match msg {
        AxumMessage::Text(t) => t.len(),
        AxumMessage::Binary(b) => b.len(),
        _ => 0,
    };
    len > max_body_bytes
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

pub async fn handle_ws_upgrade(
    Extension(app): Extension<Arc<App>>,
    path_key: Option<Path<String>>,
    headers: HeaderMap,
    ClientIp(ip): ClientIp,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = extract_bearer(&headers);
    let path_key = path_key.map(|Path(k)| k);

    let group_name = match app.authenticator.authorize(bearer.as_deref(), path_key.as_deref()).await {
        AuthOutcome::Allowed(group) => group,
        AuthOutcome::Unauthorized => return axum::http::StatusCode::UNAUTHORIZED.into_response(),
    };

    if app.rate_limit(ip).is_err() {
        return axum::http::StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let Some(group) = app.groups.get(&group_name).map(|g| g.value().clone()) else {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let ws_group_name = app
        .config
        .server
        .ws_backend_group
        .clone()
        .unwrap_or(group_name);

    let backends: Vec<Arc<Backend>> = app
        .groups
        .get(&ws_group_name)
        .map(|g| g.value().backends.clone())
        .unwrap_or_else(|| group.backends.clone());

    ws.on_upgrade(move |socket| bridge(socket, backends, app, ip))
}

/// Pick the first backend not currently banned, falling back to the first
/// configured backend if every candidate is banned (matching the HTTP
/// fallback strategy's "try anyway rather than hard-fail" stance at the
/// moment of initial connect).
fn pick_sticky_backend(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    let now = std::time::Instant::now();
    backends
        .iter()
        .find(|b| !b.is_banned(now))
        .or_else(|| backends.first())
        .cloned()
}

async fn bridge(client_socket: WebSocket, backends: Vec<Arc<Backend>>, app: Arc<App>, ip: IpAddr) {
    let Some(backend) = pick_sticky_backend(&backends) else {
        debug!("no backend available for websocket bridge");
        let _ = client_socket.close().await;
        return;
    };

    if !backend.try_acquire_ws_conn() {
        warn!(backend = %backend.name, "websocket connection rejected, backend at max_ws_conns");
        let _ = client_socket.close().await;
        return;
    }

    let upstream = match backend.transport.dial_ws().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(?err, backend = %backend.name, "failed to dial backend websocket; trying remaining candidates");
            backend.release_ws_conn();
            let mut connected = None;
            for candidate in backends.iter().filter(|b| b.name != backend.name) {
                if !candidate.try_acquire_ws_conn() {
                    continue;
                }
                match candidate.transport.dial_ws().await {
                    Ok(stream) => {
                        connected = Some((candidate.clone(), stream));
                        break;
                    }
                    Err(_) => candidate.release_ws_conn(),
                }
            }
            match connected {
                Some((candidate, stream)) => {
                    let backend = candidate;
                    return bridge_streams(client_socket, backend, stream, app, ip).await;
                }
                None => {
                    let _ = client_socket.close().await;
                    return;
                }
            }
        }
    };

    bridge_streams(client_socket, backend, upstream, app, ip).await
}

async fn bridge_streams(
    client_socket: WebSocket,
    backend: Arc<Backend>,
    upstream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    app: Arc<App>,
    ip: IpAddr,
) {
    let max_frame_bytes = app.config.server.max_body_bytes;

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            if frame_too_large(&msg, max_frame_bytes) {
                debug!(backend = %backend.name, %ip, "dropping oversized websocket frame");
                break;
            }
            if let Err(ProxydError::OverRateLimit) = app.rate_limit(ip) {
                debug!(backend = %backend.name, %ip, "websocket frame rejected by rate limiter");
                break;
            }

            let forwarded = match msg {
                AxumMessage::Text(t) => Some(TungsteniteMessage::Text(t)),
                AxumMessage::Binary(b) => Some(TungsteniteMessage::Binary(b)),
                AxumMessage::Ping(p) => Some(TungsteniteMessage::Ping(p)),
                AxumMessage::Pong(p) => Some(TungsteniteMessage::Pong(p)),
                AxumMessage::Close(_) => None,
            };
            match forwarded {
                Some(m) => {
                    if upstream_tx.send(m).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let forwarded = match msg {
                TungsteniteMessage::Text(t) => Some(AxumMessage::Text(t)),
                TungsteniteMessage::Binary(b) => Some(AxumMessage::Binary(b)),
                TungsteniteMessage::Ping(p) => Some(AxumMessage::Ping(p)),
                TungsteniteMessage::Pong(p) => Some(AxumMessage::Pong(p)),
                TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => None,
            };
            match forwarded {
                Some(m) => {
                    if client_tx.send(m).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    backend.release_ws_conn();
    debug!(backend = %backend.name, "websocket bridge closed");
}
