// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The WebSocket surface.
//!
//! Authentication happens before the upgrade: the token arrives as a
//! `?token=` query parameter or an `Authorization: Bearer` header.  A source
//! that is locked out is rejected *before* any token comparison.  After the
//! upgrade, frames follow the three-shape protocol in `jarvis_proto::frames`;
//! malformed frames are dropped silently, requests dispatch through the
//! method registry and may complete out of order (clients match on `id`).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use jarvis_auth::{AuditKind, AuditRecord};
use jarvis_proto::Frame;

use crate::methods::MethodRegistry;
use crate::state::{ClientHandle, HubState};

const CLIENT_OUTBOX_DEPTH: usize = 256;

#[derive(Clone)]
pub struct ServerState {
    pub hub: Arc<HubState>,
    pub methods: Arc<MethodRegistry>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/auth/token", get(token_handler))
        .with_state(state)
}

#[derive(serde::Deserialize, Default)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let ip = addr.ip();
    let source = ip.to_string();
    let hub = &state.hub;

    // Lockout check comes first: a locked source never reaches the token
    // comparison.
    if hub.lockout.is_locked(&source) {
        hub.audit.record(
            AuditRecord::new(AuditKind::AuthBlocked, "ws", json!({ "reason": "locked out" }))
                .with_ip(&source),
        );
        return (StatusCode::TOO_MANY_REQUESTS, "locked out").into_response();
    }

    let provided = query
        .token
        .or_else(|| bearer_token(&headers).map(str::to_string));
    let authorized = provided
        .as_deref()
        .is_some_and(|t| hub.token.verify(t));

    if !authorized {
        let locked_now = hub.lockout.record_failure(&source);
        hub.audit.record(
            AuditRecord::new(
                AuditKind::AuthFailure,
                "ws",
                json!({ "had_token": provided.is_some() }),
            )
            .with_ip(&source),
        );
        if locked_now {
            hub.audit.record(
                AuditRecord::new(
                    AuditKind::AuthBlocked,
                    "ws",
                    json!({ "reason": "failure budget exceeded" }),
                )
                .with_ip(&source),
            );
        }
        warn!(%ip, "websocket auth failed");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    hub.lockout.record_success(&source);
    hub.audit.record(
        AuditRecord::new(AuditKind::AuthSuccess, "ws", json!({})).with_ip(&source),
    );

    ws.on_upgrade(move |socket| handle_socket(socket, state, ip))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn handle_socket(mut socket: WebSocket, state: ServerState, peer: IpAddr) {
    let client_id = state.hub.next_client_id();
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Frame>(CLIENT_OUTBOX_DEPTH);
    state
        .hub
        .clients
        .insert(client_id, ClientHandle { outbox: outbox_tx });
    info!(client = client_id, %peer, "dashboard client connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match Frame::decode(&text) {
                            Ok(Frame::Req { id, method, params }) => {
                                dispatch_request(&state, client_id, id, method, params);
                            }
                            // Clients only originate requests; anything else
                            // (and malformed JSON) is dropped silently.
                            Ok(_) => {}
                            Err(e) => debug!(client = client_id, "dropping malformed frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(client = client_id, "websocket recv error: {e}");
                        break;
                    }
                }
            }
            frame = outbox_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.encode())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Removing the client drops the outbox: responses for requests still in
    // flight go nowhere, which is exactly the disconnect contract.
    state.hub.clients.remove(&client_id);
    info!(client = client_id, "dashboard client disconnected");
}

/// Requests run concurrently so a slow method cannot head-of-line block the
/// connection; the response rides the client outbox whenever it finishes.
fn dispatch_request(
    state: &ServerState,
    client_id: u64,
    id: String,
    method: String,
    params: Option<serde_json::Value>,
) {
    let hub = Arc::clone(&state.hub);
    let methods = Arc::clone(&state.methods);
    tokio::spawn(async move {
        let params = params.unwrap_or(serde_json::Value::Null);
        let frame = match methods
            .dispatch(Arc::clone(&hub), &method, params, client_id)
            .await
        {
            Ok(result) => Frame::ok(id, result),
            Err(e) => Frame::err(id, e.code, e.message),
        };
        // Clone the sender out of the map first: holding a map guard across
        // the send await would block writers.
        let outbox = hub.clients.get(&client_id).map(|c| c.outbox.clone());
        if let Some(outbox) = outbox {
            let _ = outbox.send(frame).await;
        }
    });
}

/// `/auth/token` — hands the dashboard token to co-located clients.
/// Loopback peers only; anything else is refused and audited.
async fn token_handler(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let ip = addr.ip();
    if !ip_is_loopback(ip) {
        state.hub.audit.record(
            AuditRecord::new(
                AuditKind::AuthFailure,
                "auth.token",
                json!({ "reason": "non-loopback" }),
            )
            .with_ip(ip.to_string()),
        );
        return (StatusCode::FORBIDDEN, "loopback only").into_response();
    }
    state.hub.audit.record(
        AuditRecord::new(AuditKind::Privileged, "auth.token", json!({ "action": "issue" }))
            .with_ip(ip.to_string()),
    );
    Json(json!({ "token": state.hub.token.expose() })).into_response()
}

fn ip_is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}
