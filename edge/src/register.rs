//! # Registration API
//!
//! `POST /api/register` — the HTTP endpoint an agent's `Register` call
//! hits before dialing the tunnel WebSocket. Allocates (or looks up) a
//! subdomain per requested port and persists the merged plugin config.

use crate::state::EdgeState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub client_id: String,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub config: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RegisterResponse {
    Ok { tunnels: HashMap<u16, String> },
    Err { error: String },
}

/// `POST /api/register`. Idempotent on `(client_id, port)`: an agent that
/// restarts with the same client id gets its existing subdomains back
/// rather than new ones.
pub async fn register(State(state): State<EdgeState>, Json(req): Json<RegisterRequest>) -> Response {
    if req.ports.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RegisterResponse::Err {
                error: "ports must not be empty".to_string(),
            }),
        )
            .into_response();
    }

    let mut tunnels = HashMap::new();
    for port in req.ports {
        match state.mux.store.upsert(&req.client_id, port, req.config.clone()) {
            Ok(subdomain) => {
                state.config_cache.invalidate(&subdomain);
                info!("registered {}:{} -> {}", req.client_id, port, subdomain);
                tunnels.insert(port, subdomain);
            }
            Err(err) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RegisterResponse::Err { error: err.to_string() }),
                )
                    .into_response();
            }
        }
    }

    (StatusCode::OK, Json(RegisterResponse::Ok { tunnels })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTunnelStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn register_is_idempotent_and_returns_same_subdomain() {
        let state = EdgeState::new(Arc::new(InMemoryTunnelStore::new()));
        let req = RegisterRequest {
            client_id: "c1".into(),
            ports: vec![3000],
            config: None,
        };
        let resp1 = register(State(state.clone()), Json(req)).await;
        assert_eq!(resp1.status(), StatusCode::OK);

        let req2 = RegisterRequest {
            client_id: "c1".into(),
            ports: vec![3000],
            config: None,
        };
        let resp2 = register(State(state), Json(req2)).await;
        assert_eq!(resp2.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_rejects_empty_ports() {
        let state = EdgeState::new(Arc::new(InMemoryTunnelStore::new()));
        let req = RegisterRequest {
            client_id: "c1".into(),
            ports: vec![],
            config: None,
        };
        let resp = register(State(state), Json(req)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
