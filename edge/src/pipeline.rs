//! # Visitor Middleware Pipeline
//!
//! A visitor middleware is a function of `(context, next)`; it either
//! short-circuits with a response or hands control to the next middleware.
//! This module specifies only the contract boundary — IP allow-listing and
//! basic auth are left to whoever registers a middleware. One concrete
//! middleware ([`SubdomainGatePlugin`]) ships so the chain has a real link,
//! and the per-tunnel config cache it reads from is implemented in full
//! since caching behavior is itself part of the core contract.

use crate::store::{is_subdomain_blocked, RESERVED_SUBDOMAINS};
use axum::http::StatusCode;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Context passed to every middleware: the parsed subdomain and its loaded
/// tunnel config. The visitor request itself is handled by the caller
/// (axum's extractors already gave the caller what it needs); middlewares
/// here only ever need to decide whether to let the request through.
pub struct VisitorContext<'a> {
    pub subdomain: &'a str,
    pub config: &'a JsonValue,
}

/// A middleware either lets the request through (`None`) or short-circuits
/// with a response.
pub trait VisitorMiddleware: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, ctx: &VisitorContext) -> Option<(StatusCode, String)>;
}

/// 404s reserved subdomains (`www`, `tunnel`) and anything on the
/// offensive-word blocklist, regardless of whether it happens to be
/// allocated — the same predicate `allocate_unique_subdomain` uses, so the
/// two call sites can never disagree.
pub struct SubdomainGatePlugin;

impl VisitorMiddleware for SubdomainGatePlugin {
    fn name(&self) -> &str {
        "subdomain-gate"
    }

    fn handle(&self, ctx: &VisitorContext) -> Option<(StatusCode, String)> {
        let lower = ctx.subdomain.to_ascii_lowercase();
        if RESERVED_SUBDOMAINS.contains(&lower.as_str()) || is_subdomain_blocked(&lower) {
            Some((StatusCode::NOT_FOUND, "not found".to_string()))
        } else {
            None
        }
    }
}

/// Registered-at-load-time chain, run in registration order. Returns the
/// first middleware's short-circuit response, or `None` if every
/// middleware let the request through.
pub struct MiddlewareChain {
    middlewares: Vec<Box<dyn VisitorMiddleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Box<dyn VisitorMiddleware>>) -> Self {
        Self { middlewares }
    }

    pub fn run(&self, ctx: &VisitorContext) -> Option<(StatusCode, String)> {
        for mw in &self.middlewares {
            if let Some(response) = mw.handle(ctx) {
                return Some(response);
            }
        }
        None
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new(vec![Box::new(SubdomainGatePlugin)])
    }
}

const CACHE_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    config: JsonValue,
    loaded_at: Instant,
}

/// Per-tunnel config cache, keyed by subdomain, TTL 30s.
/// Invalidated early by [`ConfigCache::invalidate`] when the config
/// changes at registration time, rather than waiting out the TTL.
pub struct ConfigCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached config for `subdomain` if present and fresh.
    pub fn get(&self, subdomain: &str) -> Option<JsonValue> {
        let entries = self.entries.read().unwrap();
        entries.get(subdomain).and_then(|e| {
            if e.loaded_at.elapsed() < CACHE_TTL {
                Some(e.config.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, subdomain: &str, config: JsonValue) {
        self.entries.write().unwrap().insert(
            subdomain.to_string(),
            CacheEntry {
                config,
                loaded_at: Instant::now(),
            },
        );
    }

    /// Drops a cached entry immediately, used when `/api/register` updates
    /// a tunnel's config so stale reads don't survive the full TTL.
    pub fn invalidate(&self, subdomain: &str) {
        self.entries.write().unwrap().remove(subdomain);
    }
}

impl Default for ConfigCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_blocks_reserved_subdomains() {
        let gate = SubdomainGatePlugin;
        let config = JsonValue::Null;
        let ctx = VisitorContext {
            subdomain: "www",
            config: &config,
        };
        assert!(gate.handle(&ctx).is_some());
    }

    #[test]
    fn gate_allows_normal_subdomains() {
        let gate = SubdomainGatePlugin;
        let config = JsonValue::Null;
        let ctx = VisitorContext {
            subdomain: "abcd",
            config: &config,
        };
        assert!(gate.handle(&ctx).is_none());
    }

    #[test]
    fn chain_runs_in_registration_order_and_stops_at_first_short_circuit() {
        struct AlwaysBlock;
        impl VisitorMiddleware for AlwaysBlock {
            fn name(&self) -> &str {
                "always-block"
            }
            fn handle(&self, _ctx: &VisitorContext) -> Option<(StatusCode, String)> {
                Some((StatusCode::FORBIDDEN, "blocked".into()))
            }
        }
        let chain = MiddlewareChain::new(vec![Box::new(AlwaysBlock), Box::new(SubdomainGatePlugin)]);
        let config = JsonValue::Null;
        let ctx = VisitorContext {
            subdomain: "abcd",
            config: &config,
        };
        let (status, _) = chain.run(&ctx).unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn cache_expires_after_ttl() {
        let cache = ConfigCache::new();
        cache.put("abcd", serde_json::json!({"k": "v"}));
        assert!(cache.get("abcd").is_some());
        cache.invalidate("abcd");
        assert!(cache.get("abcd").is_none());
    }
}
