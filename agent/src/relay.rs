//! Per-tunnel registry of local WebSocket sessions opened on behalf of a
//! visitor, keyed by the session id the edge minted.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::warn;
use tunnel_protocol::{body, Envelope, HeaderMap};

/// What the control socket's writer task knows how to send: a tagged
/// envelope, a literal ping/pong text frame, or a close instruction.
/// Shared with [`crate::tunnel`], which owns the writer task itself.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Envelope(Envelope),
    RawText(String),
    Close,
}

/// Outbound channel to the control socket, used to report `ws-frame`/
/// `ws-close` events back to the edge.
pub type ControlTx = mpsc::UnboundedSender<ControlMessage>;

struct LocalSession {
    tx: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Clone)]
pub struct LocalRelay {
    local_port: u16,
    sessions: Arc<Mutex<HashMap<String, LocalSession>>>,
}

impl LocalRelay {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Dials `ws://127.0.0.1:<local_port><path>` and starts forwarding
    /// frames back to the control socket as `ws-frame`/`ws-close`
    /// envelopes tagged with `id`.
    pub async fn handle_open(&self, id: String, path: String, mut headers: HeaderMap, control: ControlTx) {
        headers.strip_ws_handshake();
        let url = format!("ws://127.0.0.1:{}{}", self.local_port, path);

        let mut request = match url.into_client_request() {
            Ok(r) => r,
            Err(_) => {
                send_close(&control, &id, 1011, "Failed to connect to local WebSocket");
                return;
            }
        };
        for (key, value) in headers.iter() {
            if let (Ok(name), Ok(val)) = (
                tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(key.as_bytes()),
                tokio_tungstenite::tungstenite::http::HeaderValue::from_str(value),
            ) {
                request.headers_mut().insert(name, val);
            }
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("local websocket dial failed for session {}: {}", id, e);
                send_close(&control, &id, 1011, "Failed to connect to local WebSocket");
                return;
            }
        };

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        self.sessions.lock().await.insert(id.clone(), LocalSession { tx });

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let sessions = self.sessions.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        let _ = control.send(ControlMessage::Envelope(Envelope::WsFrame {
                            id: session_id.clone(),
                            is_text: true,
                            payload: text.to_string(),
                        }));
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        let _ = control.send(ControlMessage::Envelope(Envelope::WsFrame {
                            id: session_id.clone(),
                            is_text: false,
                            payload: body::encode_chunked(&bytes),
                        }));
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = control.send(ControlMessage::Envelope(Envelope::WsClose {
                            id: session_id.clone(),
                            code: Some(code),
                            reason: Some(reason),
                        }));
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => {
                        let _ = control.send(ControlMessage::Envelope(Envelope::WsClose {
                            id: session_id.clone(),
                            code: Some(1005),
                            reason: None,
                        }));
                        break;
                    }
                }
            }
            sessions.lock().await.remove(&session_id);
        });
    }

    /// Forwards a `ws-frame` from the edge onto the matching local session,
    /// dropping it silently if the session is already gone.
    pub async fn handle_frame(&self, id: &str, is_text: bool, payload: String) {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(id) else { return };
        let msg = if is_text {
            WsMessage::Text(Utf8Bytes::from(payload))
        } else {
            match body::decode(&payload) {
                Ok(bytes) => WsMessage::Binary(bytes.into()),
                Err(_) => return,
            }
        };
        let _ = session.tx.send(msg);
    }

    /// Best-effort closes the matching local session and removes it.
    pub async fn handle_close(&self, id: &str, code: Option<u16>, reason: Option<String>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(id) {
            let frame = CloseFrame {
                code: code.unwrap_or(1000).into(),
                reason: reason.unwrap_or_default().into(),
            };
            let _ = session.tx.send(WsMessage::Close(Some(frame)));
        }
    }
}

fn send_close(control: &ControlTx, id: &str, code: u16, reason: &str) {
    let _ = control.send(ControlMessage::Envelope(Envelope::WsClose {
        id: id.to_string(),
        code: Some(code),
        reason: Some(reason.to_string()),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_frame_on_unknown_session_is_a_noop() {
        let relay = LocalRelay::new(9999);
        relay.handle_frame("missing", true, "hello".to_string()).await;
    }

    #[tokio::test]
    async fn handle_close_on_unknown_session_is_a_noop() {
        let relay = LocalRelay::new(9999);
        relay.handle_close("missing", Some(1000), None).await;
    }
}
