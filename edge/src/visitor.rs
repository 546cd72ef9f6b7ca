//! # Visitor Traffic
//!
//! `* https://<subdomain>.<zone>/*` — everything that isn't the agent
//! control endpoint or `/api/register`. Routes a visitor's HTTP request or
//! WebSocket upgrade onto the agent socket registered for its subdomain.

use crate::pending::PendingOutcomeExt;
use crate::pipeline::VisitorContext;
use crate::state::{AgentOutbound, EdgeState, PendingOutcome, PendingRequest, VisitorOutbound, VisitorSocket};
use axum::body::{to_bytes, Body};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, HeaderMap as AxumHeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use tunnel_protocol::{body, Envelope, HeaderMap};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// axum's `to_bytes` needs an upper bound; large-but-legitimate visitor
/// POST bodies (property test 7 exercises 10 MiB) stay comfortably under it.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

fn subdomain_from_host(host: &str) -> String {
    host.split(':')
        .next()
        .unwrap_or(host)
        .split('.')
        .next()
        .unwrap_or("")
        .to_string()
}

fn headers_to_multimap(headers: &AxumHeaderMap) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.append(name.as_str(), v);
        }
    }
    map
}

async fn load_config(state: &EdgeState, subdomain: &str) -> serde_json::Value {
    if let Some(cached) = state.config_cache.get(subdomain) {
        return cached;
    }
    let config = state
        .mux
        .store
        .find_by_subdomain(subdomain)
        .map(|record| record.config)
        .unwrap_or(serde_json::Value::Null);
    state.config_cache.put(subdomain, config.clone());
    config
}

/// Entry point for all visitor traffic. Dispatches to the HTTP or the
/// WebSocket path once the subdomain has been resolved and gated.
pub async fn visitor_handler(State(state): State<EdgeState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let subdomain = subdomain_from_host(&host);

    let config = load_config(&state, &subdomain).await;
    let ctx = VisitorContext {
        subdomain: &subdomain,
        config: &config,
    };
    if let Some((status, body)) = state.middlewares.run(&ctx) {
        return (status, body).into_response();
    }

    let is_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !state.mux.agents.contains_key(&subdomain) {
        return (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response();
    }

    if is_upgrade {
        visitor_ws_path(state, subdomain, req).await
    } else {
        visitor_http_path(state, subdomain, req).await
    }
}

async fn visitor_http_path(state: EdgeState, subdomain: String, req: Request) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = headers_to_multimap(req.headers());

    let body_b64 = if matches!(method, Method::GET | Method::HEAD) {
        None
    } else {
        match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => Some(body::encode_chunked(&bytes)),
            Err(_) => return (StatusCode::BAD_GATEWAY, "failed to read request body").into_response(),
        }
    };

    let (resolver, outcome_rx) = oneshot::channel();
    state.mux.pending.insert(
        request_id.clone(),
        PendingRequest {
            subdomain: subdomain.clone(),
            resolver: Some(resolver),
        },
    );

    let Some(agent) = state.mux.agents.get(&subdomain).map(|a| a.tx.clone()) else {
        state.mux.take_pending(&request_id);
        return (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response();
    };

    let envelope = Envelope::HttpRequest {
        id: request_id.clone(),
        method: method.to_string(),
        path,
        headers,
        body: body_b64,
    };
    if agent.send(AgentOutbound::Message(envelope)).is_err() {
        if let Some(pending) = state.mux.take_pending(&request_id) {
            pending.resolve_tunnel_down();
        }
        return (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response();
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, outcome_rx).await {
        Ok(Ok(PendingOutcome::Response { status, headers, body })) => {
            let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            for (key, value) in headers.to_title_case_pairs() {
                builder = builder.header(key, value);
            }
            builder.body(Body::from(body)).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Ok(Ok(PendingOutcome::TunnelDown)) => (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response(),
        Ok(Err(_)) => (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response(),
        Err(_) => {
            // 30s elapsed first: reap our own entry so a late response
            // doesn't linger in the table (it'll be dropped as unknown-id).
            state.mux.take_pending(&request_id);
            (StatusCode::GATEWAY_TIMEOUT, "Local server timed out").into_response()
        }
    }
}

async fn visitor_ws_path(state: EdgeState, subdomain: String, req: Request) -> Response {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = headers_to_multimap(req.headers());
    let session_id = Uuid::new_v4().to_string();

    let Some(agent) = state.mux.agents.get(&subdomain).map(|a| a.tx.clone()) else {
        return (StatusCode::BAD_GATEWAY, "Tunnel not connected").into_response();
    };
    let _ = agent.send(AgentOutbound::Message(Envelope::WsOpen {
        id: session_id.clone(),
        path,
        headers,
    }));

    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(u) => u,
        Err(rejection) => return rejection.into_response(),
    };

    upgrade.on_upgrade(move |socket| handle_visitor_socket(socket, state, subdomain, session_id, agent))
}

async fn handle_visitor_socket(
    socket: WebSocket,
    state: EdgeState,
    subdomain: String,
    session_id: String,
    agent: crate::state::AgentTx,
) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<VisitorOutbound>();

    state.mux.visitors.insert(
        session_id.clone(),
        VisitorSocket {
            session_id: session_id.clone(),
            subdomain: subdomain.clone(),
            tx,
        },
    );

    let writer = tokio::spawn(async move {
        let mut sink = ws_sink;
        while let Some(msg) = rx.recv().await {
            let sent = match msg {
                VisitorOutbound::Text(text) => sink.send(Message::Text(text.into())).await,
                VisitorOutbound::Binary(bytes) => sink.send(Message::Binary(bytes.into())).await,
                VisitorOutbound::Close { code, reason } => {
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
        let frame = match msg {
            Message::Text(text) => Some(Envelope::WsFrame {
                id: session_id.clone(),
                is_text: true,
                payload: text.to_string(),
            }),
            Message::Binary(bytes) => Some(Envelope::WsFrame {
                id: session_id.clone(),
                is_text: false,
                payload: body::encode_chunked(&bytes),
            }),
            Message::Close(_) => break,
            _ => None,
        };
        if let Some(frame) = frame {
            if agent.send(AgentOutbound::Message(frame)).is_err() {
                warn!("agent socket gone mid-session for {}", session_id);
                break;
            }
        }
    }

    writer.abort();
    if let Some((_, _visitor)) = state.mux.visitors.remove(&session_id) {
        let _ = agent.send(AgentOutbound::Message(Envelope::WsClose {
            id: session_id,
            code: Some(1000),
            reason: None,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_from_host_strips_port_and_zone() {
        assert_eq!(subdomain_from_host("abcd.tunnel.dev:443"), "abcd");
        assert_eq!(subdomain_from_host("abcd.tunnel.dev"), "abcd");
    }
}
