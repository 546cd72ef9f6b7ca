//! # Tunnel Agent
//!
//! Developer-machine CLI that registers a set of local ports with the
//! tunnel edge and keeps a reconnecting control WebSocket open for each
//! one, proxying visitor HTTP requests and WebSocket sessions onto
//! `127.0.0.1:<port>`.
//!
//! ## Modules
//!
//! - [`cli`]      — argument parsing
//! - [`client_id`] — persisted `$HOME/.prod/id`
//! - [`config`]    — optional `$HOME/.prod/config.toml`
//! - [`register`]  — `POST /api/register`
//! - [`pipeline`]  — request/connection plugin hooks
//! - [`tunnel`]    — reconnect loop + serve loop
//! - [`relay`]     — local WebSocket session registry
//! - [`proxy`]     — local HTTP proxying
//! - [`error`]     — structured errors at the proxy/register seams

mod cli;
mod client_id;
mod config;
mod error;
mod pipeline;
mod proxy;
mod register;
mod relay;
mod tunnel;

use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_agent=info".into()))
        .init();

    let cli = cli::Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: cli::Cli) -> i32 {
    let client_id = match client_id::load_or_create() {
        Ok(id) => id,
        Err(e) => {
            error!("failed to load or create client id: {e:#}");
            return 1;
        }
    };
    info!("client id: {}", client_id);

    let config_path = cli.config.clone().or_else(config::default_path);
    let file_config = match config::load(config_path.as_deref()) {
        Ok(blob) => blob,
        Err(e) => {
            error!("failed to load config: {e:#}");
            return 1;
        }
    };

    let plugins = Arc::new(pipeline::default_chain());
    let config_blob = pipeline::merge_config(file_config, plugins.worker_config());

    let worker_url = cli.resolve_worker_url();
    let http_client = reqwest::Client::new();
    let tunnels = match register::register(&http_client, &worker_url, &client_id, &cli.ports, &config_blob).await {
        Ok(tunnels) => tunnels,
        Err(e) => {
            error!("registration failed: {e:#}");
            return 1;
        }
    };

    for port in &cli.ports {
        match tunnels.get(&port.to_string()) {
            Some(subdomain) => info!("{} -> https://{}.<zone>/", port, subdomain),
            None => error!("edge did not return a subdomain for port {}", port),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutting down");
        let _ = shutdown_tx.send(true);
    });

    let handles: Vec<_> = ports_with_subdomains(&cli.ports, &tunnels)
        .into_iter()
        .map(|(port, subdomain)| {
            let worker_url = worker_url.clone();
            let plugins = plugins.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { tunnel::run(subdomain, port, &worker_url, plugins, shutdown_rx).await })
        })
        .collect();

    for handle in handles {
        let _ = handle.await;
    }
    0
}

fn ports_with_subdomains(ports: &[u16], tunnels: &HashMap<String, String>) -> Vec<(u16, String)> {
    ports
        .iter()
        .filter_map(|port| tunnels.get(&port.to_string()).map(|subdomain| (*port, subdomain.clone())))
        .collect()
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
