//! Multi-value HTTP header map.
//!
//! Wire representation is a JSON object `{ "X-Key": ["v1", "v2"], ... }`.
//! Lookups are case-insensitive; the key as first received is kept for
//! logging and re-emission order is preserved within a key.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Headers not forwarded when proxying visitor request → local server.
/// Stripping `Accept-Encoding` prevents the edge from later stripping a
/// `Content-Encoding` the local server chose, which would leave the
/// visitor holding undecoded bytes.
pub const REQUEST_HOP_BY_HOP: &[&str] = &["accept-encoding"];

/// Headers not forwarded when proxying local response → visitor. Both are
/// stripped only after the local HTTP client has already decompressed and
/// rebuffered the body, since they'd otherwise describe a body that no
/// longer exists in that form.
pub const RESPONSE_HOP_BY_HOP: &[&str] = &["content-encoding", "content-length"];

/// Hop-by-hop headers stripped when dialing a local WebSocket — the local
/// dial performs its own handshake and must not inherit the visitor's.
pub const WS_HANDSHAKE_HOP_BY_HOP: &[&str] = &["upgrade", "connection"];

fn is_ws_handshake_header(lower: &str) -> bool {
    WS_HANDSHAKE_HOP_BY_HOP.contains(&lower) || lower.starts_with("sec-websocket-")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    /// `(original-case key, values)` in first-seen order.
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn find(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Appends a value, preserving the original key casing of the first
    /// occurrence and the order of values within the key.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        if let Some(idx) = self.find(key) {
            self.entries[idx].1.push(value.into());
        } else {
            self.entries.push((key.to_string(), vec![value.into()]));
        }
    }

    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.find(key)
            .map(|idx| self.entries[idx].1.clone())
            .unwrap_or_default()
    }

    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.find(key).and_then(|idx| self.entries[idx].1.first().map(String::as_str))
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(idx) = self.find(key) {
            self.entries.remove(idx);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every header in `names` (case-insensitive). Used for the
    /// request-side and response-side hop-by-hop filtering rules.
    pub fn strip(&mut self, names: &[&str]) {
        self.entries
            .retain(|(k, _)| !names.iter().any(|n| k.eq_ignore_ascii_case(n)));
    }

    /// Drops WebSocket handshake hop-by-hop headers before dialing a local
    /// WS server.
    pub fn strip_ws_handshake(&mut self) {
        self.entries
            .retain(|(k, _)| !is_ws_handshake_header(&k.to_ascii_lowercase()));
    }

    /// Converts each key to canonical Title-Case-with-hyphens form, the
    /// shape the local HTTP client re-serializes headers in.
    pub fn to_title_case_pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| {
                let canonical = title_case(k);
                vs.iter().map(move |v| (canonical.clone(), v.clone()))
            })
            .collect()
    }
}

fn title_case(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, vs) in &self.entries {
            map.serialize_entry(k, vs)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderMapVisitor;

        impl<'de> Visitor<'de> for HeaderMapVisitor {
            type Value = HeaderMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header name to array of string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, values)) = map.next_entry::<String, Vec<String>>()? {
                    entries.push((key, values));
                }
                Ok(HeaderMap { entries })
            }
        }

        deserializer.deserialize_map(HeaderMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_lookup_preserves_first_seen_casing() {
        let mut h = HeaderMap::new();
        h.append("X-Request-Id", "abc");
        h.append("x-request-id", "def");
        assert_eq!(h.get_all("X-REQUEST-ID"), vec!["abc", "def"]);
        assert_eq!(h.entries.len(), 1);
    }

    #[test]
    fn strip_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.append("Accept-Encoding", "gzip");
        h.append("X-Keep", "1");
        h.strip(REQUEST_HOP_BY_HOP);
        assert!(!h.contains("accept-encoding"));
        assert!(h.contains("x-keep"));
    }

    #[test]
    fn title_case_normalizes_hyphenated_keys() {
        let mut h = HeaderMap::new();
        h.append("x-forwarded-for", "1.2.3.4");
        let pairs = h.to_title_case_pairs();
        assert_eq!(pairs[0].0, "X-Forwarded-For");
    }

    #[test]
    fn ws_handshake_headers_are_stripped() {
        let mut h = HeaderMap::new();
        h.append("Upgrade", "websocket");
        h.append("Connection", "Upgrade");
        h.append("Sec-WebSocket-Key", "xyz");
        h.append("Sec-WebSocket-Version", "13");
        h.append("X-Keep", "1");
        h.strip_ws_handshake();
        assert_eq!(h.entries.len(), 1);
        assert!(h.contains("x-keep"));
    }
}
