//! Tagged-union envelope carried over the control WebSocket.
//!
//! Every application-level message is a JSON object with a `"type"` field
//! (serde's internally-tagged representation, `rename_all = "snake_case"`).
//! The two liveness frames (`"ping"` / `"pong"`) are plain text, not JSON,
//! and are handled one level up by whichever side reads the raw frame.

use crate::headers::HeaderMap;
use serde::{Deserialize, Serialize};

/// One message of the tunnel wire protocol.
///
/// Unknown `type` values and unknown fields within a known message must be
/// ignored by readers — `serde`'s default behavior already does the latter;
/// the former is handled explicitly by callers matching on a `Result` from
/// `serde_json::from_str` and dropping parse failures rather than erroring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// edge → agent: a visitor HTTP request to proxy to the local server.
    HttpRequest {
        id: String,
        method: String,
        /// Path plus query string, e.g. `/foo?x=1`.
        path: String,
        headers: HeaderMap,
        /// Base64 of the raw body. Omitted for GET/HEAD and empty bodies.
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// agent → edge: the local server's response to a prior `http-request`.
    HttpResponse {
        id: String,
        status: u16,
        headers: HeaderMap,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// edge → agent: a visitor WebSocket upgrade to proxy to a local socket.
    WsOpen {
        id: String,
        path: String,
        headers: HeaderMap,
    },
    /// both directions: one WebSocket frame belonging to session `id`.
    WsFrame {
        id: String,
        is_text: bool,
        /// Raw text if `is_text`, base64 of the binary payload otherwise.
        payload: String,
    },
    /// both directions: session `id` has closed.
    WsClose {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Literal text frame sent by the agent every 30s and ignored by the edge's
/// automatic responder.
pub const PING: &str = "ping";
/// Literal text frame a `"ping"` elicits; a no-op for the receiver.
pub const PONG: &str = "pong";

impl Envelope {
    /// The `id` correlating this message to a request or a WS session.
    pub fn id(&self) -> &str {
        match self {
            Envelope::HttpRequest { id, .. }
            | Envelope::HttpResponse { id, .. }
            | Envelope::WsOpen { id, .. }
            | Envelope::WsFrame { id, .. }
            | Envelope::WsClose { id, .. } => id,
        }
    }

    /// Parses a raw text frame body into an envelope, returning `None` for
    /// the liveness frames and for anything that fails to parse — both
    /// cases are "drop silently" per the wire protocol's compatibility rule.
    pub fn parse(raw: &str) -> Option<Envelope> {
        if raw == PING || raw == PONG {
            return None;
        }
        serde_json::from_str(raw).ok()
    }

    pub fn to_json(&self) -> String {
        // Envelope fields are plain strings/numbers; serialization cannot
        // fail short of an allocator error, so unwrap is appropriate here.
        serde_json::to_string(self).expect("envelope always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn http_request_round_trips_and_omits_body() {
        let env = Envelope::HttpRequest {
            id: "req-1".into(),
            method: "GET".into(),
            path: "/foo?x=1".into(),
            headers: HeaderMap::new(),
            body: None,
        };
        let json = env.to_json();
        assert!(!json.contains("\"body\""));
        let back = Envelope::parse(&json).unwrap();
        assert_eq!(back.id(), "req-1");
    }

    #[test]
    fn unknown_type_is_dropped_silently() {
        assert!(Envelope::parse(r#"{"type":"reticulate-splines"}"#).is_none());
    }

    #[test]
    fn ping_pong_literals_are_not_envelopes() {
        assert!(Envelope::parse("ping").is_none());
        assert!(Envelope::parse("pong").is_none());
    }

    #[test]
    fn unknown_fields_within_known_message_are_ignored() {
        let raw = r#"{"type":"ws-close","id":"s1","from_the_future":true}"#;
        let env = Envelope::parse(raw).unwrap();
        match env {
            Envelope::WsClose { id, code, reason } => {
                assert_eq!(id, "s1");
                assert_eq!(code, None);
                assert_eq!(reason, None);
            }
            _ => panic!("expected ws-close"),
        }
    }

    #[test]
    fn header_map_multi_value_round_trips() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", "a");
        headers.append("Set-Cookie", "b");
        let env = Envelope::HttpResponse {
            id: "r1".into(),
            status: 200,
            headers,
            body: None,
        };
        let json = env.to_json();
        let back = Envelope::parse(&json).unwrap();
        match back {
            Envelope::HttpResponse { headers, .. } => {
                let values = headers.get_all("set-cookie");
                assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
            }
            _ => panic!("expected http-response"),
        }
    }

    #[test]
    fn kebab_case_tag_matches_wire_protocol_names() {
        let json = Envelope::WsOpen {
            id: "s".into(),
            path: "/".into(),
            headers: HeaderMap::new(),
        }
        .to_json();
        let v: BTreeMap<String, serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "ws-open");
    }
}
