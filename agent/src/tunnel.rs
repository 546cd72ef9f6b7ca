//! `StartTunnel`: the agent's reconnect loop plus per-connection serve
//! loop. One call to [`run`] drives exactly one `(subdomain, local_port)`
//! pair for the lifetime of the process, or until `shutdown` fires.

use crate::pipeline::{PluginChain, RequestContext};
use crate::proxy;
use crate::relay::{ControlMessage, LocalRelay};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};
use tunnel_protocol::envelope::{PING, PONG};
use tunnel_protocol::Envelope;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

fn tunnel_ws_url(worker_url: &str, subdomain: &str) -> String {
    let ws_base = if let Some(rest) = worker_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = worker_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        worker_url.to_string()
    };
    format!("{}/_tunnel?subdomain={}", ws_base.trim_end_matches('/'), subdomain)
}

/// Blocking reconnect loop. Returns once `shutdown` reports `true` and the
/// in-flight connection (if any) has torn down cleanly.
pub async fn run(
    subdomain: String,
    local_port: u16,
    worker_url: &str,
    plugins: Arc<PluginChain>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = tunnel_ws_url(worker_url, &subdomain);
    let http_client = proxy::local_client();
    let relay = LocalRelay::new(local_port);

    loop {
        if *shutdown.borrow() {
            return;
        }

        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!("tunnel connected: {} -> 127.0.0.1:{}", subdomain, local_port);
                plugins.on_connect(&subdomain, local_port);
                let reason = serve(ws_stream, &subdomain, local_port, &http_client, &relay, &plugins, &mut shutdown).await;
                plugins.on_disconnect(&subdomain, &reason);
                warn!("tunnel disconnected: {} ({})", subdomain, reason);
            }
            Err(e) => {
                error!("tunnel dial failed for {}: {}", subdomain, e);
            }
        }

        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn serve(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    subdomain: &str,
    local_port: u16,
    http_client: &reqwest::Client,
    relay: &LocalRelay,
    plugins: &Arc<PluginChain>,
    shutdown: &mut watch::Receiver<bool>,
) -> String {
    let (mut sink, mut stream) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    // Writer task: the single owner of the sink, serializing every
    // outbound frame (response, keepalive, WS relay) through one channel.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let sent = match msg {
                ControlMessage::Envelope(env) => sink.send(WsMessage::Text(env.to_json().into())).await,
                ControlMessage::RawText(text) => sink.send(WsMessage::Text(text.into())).await,
                ControlMessage::Close => {
                    let _ = sink
                        .send(WsMessage::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                            code: 1000u16.into(),
                            reason: "shutdown".into(),
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

    let keepalive_tx = tx.clone();
    let keepalive = tokio::spawn(async move {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            if keepalive_tx.send(ControlMessage::RawText(PING.to_string())).is_err() {
                break;
            }
        }
    });

    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = tx.send(ControlMessage::Close);
                    break "shutdown".to_string();
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.as_str() == PONG {
                            continue;
                        }
                        if text.as_str() == PING {
                            let _ = tx.send(ControlMessage::RawText(PONG.to_string()));
                            continue;
                        }
                        // Spawned independently so a slow local server never
                        // blocks the read loop from servicing other sessions.
                        let tx2 = tx.clone();
                        let relay2 = relay.clone();
                        let client2 = http_client.clone();
                        let plugins2 = plugins.clone();
                        let subdomain2 = subdomain.to_string();
                        let local_port2 = local_port;
                        let raw = text.to_string();
                        tokio::spawn(async move {
                            handle_message(&raw, tx2, relay2, client2, plugins2, subdomain2, local_port2).await;
                        });
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break "connection closed".to_string(),
                    Some(Err(e)) => break format!("read error: {e}"),
                    _ => {}
                }
            }
        }
    };

    keepalive.abort();
    writer.abort();
    reason
}

async fn handle_message(
    raw: &str,
    control: mpsc::UnboundedSender<ControlMessage>,
    relay: LocalRelay,
    http_client: reqwest::Client,
    plugins: Arc<PluginChain>,
    subdomain: String,
    local_port: u16,
) {
    let Some(env) = Envelope::parse(raw) else {
        return;
    };

    match env {
        Envelope::HttpRequest { id, method, path, mut headers, body } => {
            plugins.on_request(&subdomain);
            let ctx = RequestContext {
                request_id: id.clone(),
                subdomain,
                started_at: Instant::now(),
            };
            plugins.before_proxy(&ctx, &mut headers);
            let mut response = proxy::proxy_http_request(&http_client, local_port, &id, &method, &path, headers, body).await;
            if let Envelope::HttpResponse { status, headers, .. } = &mut response {
                plugins.after_proxy(&ctx, *status, headers);
            }
            let _ = control.send(ControlMessage::Envelope(response));
        }
        Envelope::WsOpen { id, path, headers } => {
            relay.handle_open(id, path, headers, control).await;
        }
        Envelope::WsFrame { id, is_text, payload } => {
            relay.handle_frame(&id, is_text, payload).await;
        }
        Envelope::WsClose { id, code, reason } => {
            relay.handle_close(&id, code, reason).await;
        }
        Envelope::HttpResponse { .. } => {
            warn!("agent received an edge-originated message type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_converts_https_and_appends_subdomain_query() {
        assert_eq!(
            tunnel_ws_url("https://tunnel.example.dev", "abcd"),
            "wss://tunnel.example.dev/_tunnel?subdomain=abcd"
        );
        assert_eq!(
            tunnel_ws_url("http://localhost:7070", "abcd"),
            "ws://localhost:7070/_tunnel?subdomain=abcd"
        );
    }
}
