//! # Tunnel Edge
//!
//! The publicly-reachable half of the tunnel multiplexer: holds every
//! connected agent's control WebSocket and serves visitor traffic by
//! proxying it onto the matching agent socket.
//!
//! ## Architecture
//!
//! ```text
//! Visitor ──HTTPS──► Edge ──WS (control channel)──► Agent ──HTTP/WS──► Local Server
//! ```
//!
//! ## Modules
//!
//! - [`store`]     — tunnel persistence contract + subdomain allocation
//! - [`state`]     — mux index tables (agents/visitors/pending requests)
//! - [`pipeline`]  — visitor middleware chain + per-tunnel config cache
//! - [`pending`]   — pending-request resolution helpers
//! - [`agent_ws`]  — `/_tunnel` agent control-channel endpoint
//! - [`visitor`]   — visitor HTTP and WebSocket proxying
//! - [`register`]  — `/api/register` REST endpoint

mod agent_ws;
mod pending;
mod pipeline;
mod register;
mod state;
mod store;
mod visitor;

use axum::routing::{get, post};
use axum::Router;
use state::EdgeState;
use std::net::SocketAddr;
use std::sync::Arc;
use store::InMemoryTunnelStore;
use tower_http::cors::CorsLayer;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_edge=info".into()),
        )
        .init();

    let state = EdgeState::new(Arc::new(InMemoryTunnelStore::new()));

    let app = Router::new()
        .route("/_tunnel", get(agent_ws::agent_ws_handler))
        .route("/api/register", post(register::register))
        .fallback(visitor::visitor_handler)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 7070));
    info!("tunnel edge listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
