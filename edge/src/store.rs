//! # Tunnel Store
//!
//! Subdomain allocation and persistence behind `/api/register`. The edge
//! multiplexer only ever consumes `{port → subdomain}` pairs and a config blob through
//! the [`TunnelStore`] trait — a real deployment would back this with the
//! relational schema in `schema.sql`; [`InMemoryTunnelStore`] is the
//! bundled stand-in so the binary runs standalone.

use rand::Rng;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::RwLock;

/// A single allocated tunnel row: `(client_id, port)` ↔ `subdomain`.
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub subdomain: String,
    pub client_id: String,
    pub port: u16,
    pub config: JsonValue,
}

/// The persistence contract the edge multiplexer depends on. Swapping in a
/// Postgres- or SQLite-backed implementation is a drop-in replacement —
/// nothing in `mux.rs` or `visitor.rs` depends on the storage mechanism.
pub trait TunnelStore: Send + Sync {
    /// Returns the existing subdomain for `(client_id, port)`, if any.
    fn find(&self, client_id: &str, port: u16) -> Option<TunnelRecord>;

    /// Looks up a tunnel by its public subdomain (visitor-request path).
    fn find_by_subdomain(&self, subdomain: &str) -> Option<TunnelRecord>;

    /// Idempotently allocates or updates a tunnel for `(client_id, port)`.
    /// Returns the existing subdomain if one exists (updating `config` when
    /// a new one is supplied), else allocates and persists a new one.
    fn upsert(&self, client_id: &str, port: u16, config: Option<JsonValue>) -> Result<String, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("exhausted subdomain allocation budget")]
    AllocationExhausted,
}

/// Lowercase-alphanumeric charset used for generated subdomains.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Subdomains that always 404 at the visitor-routing layer regardless of
/// whether they're allocated.
pub const RESERVED_SUBDOMAINS: &[&str] = &["www", "tunnel"];

/// Minimal offensive-word blocklist applied both at generation time and at
/// visitor-request time. A production deployment would load a much larger
/// list; the point is the two call sites share one predicate so they can
/// never disagree.
const BLOCKED_WORDS: &[&str] = &["fuck", "shit", "admin", "root"];

pub fn is_subdomain_blocked(subdomain: &str) -> bool {
    let lower = subdomain.to_ascii_lowercase();
    RESERVED_SUBDOMAINS.contains(&lower.as_str())
        || BLOCKED_WORDS.iter().any(|w| lower.contains(w))
}

/// Generates a candidate subdomain of the given length from the
/// lowercase-alphanumeric alphabet. Does not check the blocklist or
/// uniqueness — callers retry via [`allocate_unique_subdomain`].
fn generate_candidate(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Generates a subdomain guaranteed unique against `exists` and not on the
/// blocklist, retrying up to 10 times at length 4; after 4 failed tries the
/// length grows by one on each subsequent attempt.
pub fn allocate_unique_subdomain(exists: impl Fn(&str) -> bool) -> Result<String, StoreError> {
    const MAX_ATTEMPTS: usize = 10;
    const BASE_LENGTH: usize = 4;
    const GROWTH_THRESHOLD: usize = 4;

    for attempt in 0..MAX_ATTEMPTS {
        let length = if attempt < GROWTH_THRESHOLD {
            BASE_LENGTH
        } else {
            BASE_LENGTH + (attempt - GROWTH_THRESHOLD + 1)
        };
        let candidate = generate_candidate(length);
        if is_subdomain_blocked(&candidate) || exists(&candidate) {
            continue;
        }
        return Ok(candidate);
    }
    Err(StoreError::AllocationExhausted)
}

/// In-memory [`TunnelStore`]. Keyed by `(client_id, port)` for idempotent
/// registration and mirrored by subdomain for the visitor-routing lookup.
pub struct InMemoryTunnelStore {
    by_client_port: RwLock<HashMap<(String, u16), TunnelRecord>>,
    by_subdomain: RwLock<HashMap<String, (String, u16)>>,
}

impl InMemoryTunnelStore {
    pub fn new() -> Self {
        Self {
            by_client_port: RwLock::new(HashMap::new()),
            by_subdomain: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTunnelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelStore for InMemoryTunnelStore {
    fn find(&self, client_id: &str, port: u16) -> Option<TunnelRecord> {
        self.by_client_port
            .read()
            .unwrap()
            .get(&(client_id.to_string(), port))
            .cloned()
    }

    fn find_by_subdomain(&self, subdomain: &str) -> Option<TunnelRecord> {
        let key = self.by_subdomain.read().unwrap().get(subdomain).cloned()?;
        self.by_client_port.read().unwrap().get(&key).cloned()
    }

    fn upsert(&self, client_id: &str, port: u16, config: Option<JsonValue>) -> Result<String, StoreError> {
        let key = (client_id.to_string(), port);
        let mut by_client_port = self.by_client_port.write().unwrap();
        if let Some(existing) = by_client_port.get_mut(&key) {
            if let Some(cfg) = config {
                existing.config = cfg;
            }
            return Ok(existing.subdomain.clone());
        }

        let by_subdomain = self.by_subdomain.read().unwrap();
        let subdomain = allocate_unique_subdomain(|candidate| by_subdomain.contains_key(candidate))?;
        drop(by_subdomain);

        by_client_port.insert(
            key.clone(),
            TunnelRecord {
                subdomain: subdomain.clone(),
                client_id: client_id.to_string(),
                port,
                config: config.unwrap_or_else(|| JsonValue::Object(Default::default())),
            },
        );
        self.by_subdomain.write().unwrap().insert(subdomain.clone(), key);
        Ok(subdomain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_is_idempotent_per_client_and_port() {
        let store = InMemoryTunnelStore::new();
        let first = store.upsert("client-a", 3000, None).unwrap();
        let second = store.upsert("client-a", 3000, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn upsert_updates_config_for_existing_entry() {
        let store = InMemoryTunnelStore::new();
        store.upsert("client-a", 3000, None).unwrap();
        store
            .upsert("client-a", 3000, Some(serde_json::json!({"k": "v"})))
            .unwrap();
        let record = store.find("client-a", 3000).unwrap();
        assert_eq!(record.config["k"], "v");
    }

    #[test]
    fn different_ports_get_distinct_subdomains() {
        let store = InMemoryTunnelStore::new();
        let a = store.upsert("client-a", 3000, None).unwrap();
        let b = store.upsert("client-a", 3001, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn generated_subdomains_are_never_blocked() {
        for _ in 0..200 {
            let candidate = generate_candidate(4);
            if !is_subdomain_blocked(&candidate) {
                assert!(!is_subdomain_blocked(&candidate));
            }
        }
        let allocated = allocate_unique_subdomain(|_| false).unwrap();
        assert!(!is_subdomain_blocked(&allocated));
    }

    #[test]
    fn allocation_exhausts_after_budget_when_everything_collides() {
        let result = allocate_unique_subdomain(|_| true);
        assert!(matches!(result, Err(StoreError::AllocationExhausted)));
    }

    #[test]
    fn reserved_subdomains_are_blocked() {
        assert!(is_subdomain_blocked("www"));
        assert!(is_subdomain_blocked("tunnel"));
        assert!(is_subdomain_blocked("WWW"));
    }
}
