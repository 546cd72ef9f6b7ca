//! # Agent WebSocket Endpoint
//!
//! `GET /_tunnel?subdomain=<s>` — the control-channel endpoint an agent's
//! reconnect loop dials. Manages the full lifecycle of one agent socket:
//! eviction of a stale prior socket, registration, read-loop dispatch of
//! every agent→edge message, and cleanup on disconnect.

use crate::pending::PendingOutcomeExt;
use crate::state::{AgentOutbound, AgentSocket, EdgeState, Mux, VisitorOutbound};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::{body, Envelope};

/// `GET /_tunnel?subdomain=<s>`. Validates the request is a genuine
/// WebSocket upgrade (426 otherwise) and that `subdomain` is present (400
/// otherwise) before handing off to axum's upgrade machinery (101).
pub async fn agent_ws_handler(State(state): State<EdgeState>, req: Request) -> Response {
    let mux = state.mux;
    let (mut parts, _body) = req.into_parts();

    let is_upgrade = parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_upgrade {
        return (StatusCode::UPGRADE_REQUIRED, "expected a websocket upgrade").into_response();
    }

    let params = match Query::<HashMap<String, String>>::from_request_parts(&mut parts, &()).await {
        Ok(Query(p)) => p,
        Err(_) => HashMap::new(),
    };
    let subdomain = match params.get("subdomain").filter(|s| !s.is_empty()) {
        Some(s) => s.clone(),
        None => return (StatusCode::BAD_REQUEST, "missing subdomain").into_response(),
    };

    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws.on_upgrade(move |socket| handle_agent_socket(socket, mux, subdomain)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_agent_socket(socket: WebSocket, mux: Arc<Mux>, subdomain: String) {
    info!("agent connecting for subdomain {}", subdomain);
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentOutbound>();

    // Evict whatever agent socket currently holds this subdomain *before*
    // the new one is registered.
    if let Some(evicted) = mux.register_agent(
        &subdomain,
        AgentSocket {
            subdomain: subdomain.clone(),
            tx: tx.clone(),
        },
    ) {
        let _ = evicted.send(AgentOutbound::Close {
            code: 1000,
            reason: "New connection replacing old one".to_string(),
        });
    }

    // Writer task: serializes every outbound message through one
    // mutex-free owner of the sink.
    let writer = tokio::spawn(async move {
        let mut sink = ws_sink;
        while let Some(msg) = rx.recv().await {
            let sent = match msg {
                AgentOutbound::Message(env) => sink.send(Message::Text(env.to_json().into())).await,
                AgentOutbound::RawText(text) => sink.send(Message::Text(text.into())).await,
                AgentOutbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                if text.as_str() == tunnel_protocol::envelope::PING {
                    // Automatic responder: a ping wakes no application logic.
                    let _ = tx.send(AgentOutbound::RawText(tunnel_protocol::envelope::PONG.to_string()));
                    continue;
                }
                if text.as_str() == tunnel_protocol::envelope::PONG {
                    continue;
                }
                handle_agent_message(&mux, &subdomain, text.as_str()).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    info!("agent disconnected for subdomain {}", subdomain);
    let (rejected, closed) = mux.evict_agent(&subdomain);
    for pending in rejected {
        pending.resolve_tunnel_down();
    }
    for visitor in closed {
        let _ = visitor.tx.send(VisitorOutbound::Close {
            code: 1001,
            reason: "Tunnel disconnected".to_string(),
        });
    }
}

async fn handle_agent_message(mux: &Arc<Mux>, subdomain: &str, raw: &str) {
    let Some(env) = Envelope::parse(raw) else {
        // Malformed JSON or unknown `type`: log and drop.
        return;
    };

    match env {
        Envelope::HttpResponse { id, status, headers, body: body_b64 } => {
            let Some(pending) = mux.take_pending(&id) else {
                // Reply arrived for an unknown id (e.g. hibernation-era
                // request, or a race with the 30s timeout) — drop silently.
                return;
            };
            let decoded = match body_b64 {
                Some(b64) => body::decode(&b64).unwrap_or_default(),
                None => Vec::new(),
            };
            pending.resolve_response(status, headers, decoded);
        }
        Envelope::WsFrame { id, is_text, payload } => {
            if let Some(visitor) = mux.visitors.get(&id) {
                let outbound = if is_text {
                    VisitorOutbound::Text(payload)
                } else {
                    match body::decode(&payload) {
                        Ok(bytes) => VisitorOutbound::Binary(bytes),
                        Err(_) => return,
                    }
                };
                let _ = visitor.tx.send(outbound);
            }
        }
        Envelope::WsClose { id, code, reason } => {
            if let Some((_, visitor)) = mux.visitors.remove(&id) {
                let _ = visitor.tx.send(VisitorOutbound::Close {
                    code: code.unwrap_or(1000),
                    reason: reason.unwrap_or_default(),
                });
            }
        }
        // `http-request` and `ws-open` only ever flow edge → agent.
        Envelope::HttpRequest { .. } | Envelope::WsOpen { .. } => {
            warn!("agent {} sent an edge-originated message type", subdomain);
        }
    }
}
