//! Agent-side plugin pipeline: request hooks that can rewrite a proxied
//! request/response, and connection hooks that observe tunnel lifecycle.

use serde_json::{Map, Value};
use std::time::Instant;
use tunnel_protocol::HeaderMap;

/// Per-request bookkeeping visible to `on_request`/`before_proxy`/
/// `after_proxy`, kept alive across the local HTTP round trip for one
/// `http-request`. All three hooks run in the same spawned dispatch task,
/// so a plugin can correlate them through its own fields on this struct
/// rather than thread-local state.
pub struct RequestContext {
    pub request_id: String,
    pub subdomain: String,
    pub started_at: Instant,
}

pub trait AgentPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool {
        true
    }

    /// Config contributed to the `config` field sent at `/api/register`.
    /// Later-registered plugins win key conflicts during the merge.
    fn worker_config(&self) -> Option<Value> {
        None
    }

    /// Fires before `before_proxy`, in the same dispatch, once the
    /// envelope's subdomain is known but before the request is handled.
    fn on_request(&self, _subdomain: &str) {}

    /// Runs before the local HTTP round trip; may rewrite request headers.
    fn before_proxy(&self, _ctx: &RequestContext, _headers: &mut HeaderMap) {}

    /// Runs after the local HTTP round trip; sees the resolved status.
    fn after_proxy(&self, _ctx: &RequestContext, _status: u16, _headers: &mut HeaderMap) {}

    /// Runs once per successful dial, before the serve loop starts.
    fn on_connect(&self, _subdomain: &str, _local_port: u16) {}

    /// Runs once the serve loop exits, whatever the reason.
    fn on_disconnect(&self, _subdomain: &str, _reason: &str) {}
}

#[derive(Default)]
pub struct PluginChain {
    plugins: Vec<Box<dyn AgentPlugin>>,
}

impl PluginChain {
    pub fn new(plugins: Vec<Box<dyn AgentPlugin>>) -> Self {
        Self { plugins }
    }

    /// Union of every enabled plugin's `worker_config()`, in registration
    /// order, later plugins overwriting keys earlier ones set.
    pub fn worker_config(&self) -> Value {
        let mut merged = Map::new();
        for plugin in self.plugins.iter().filter(|p| p.enabled()) {
            if let Some(Value::Object(map)) = plugin.worker_config() {
                merged.extend(map);
            }
        }
        Value::Object(merged)
    }

    pub fn on_request(&self, subdomain: &str) {
        for plugin in self.plugins.iter().filter(|p| p.enabled()) {
            plugin.on_request(subdomain);
        }
    }

    pub fn before_proxy(&self, ctx: &RequestContext, headers: &mut HeaderMap) {
        for plugin in self.plugins.iter().filter(|p| p.enabled()) {
            plugin.before_proxy(ctx, headers);
        }
    }

    pub fn after_proxy(&self, ctx: &RequestContext, status: u16, headers: &mut HeaderMap) {
        for plugin in self.plugins.iter().filter(|p| p.enabled()) {
            plugin.after_proxy(ctx, status, headers);
        }
    }

    pub fn on_connect(&self, subdomain: &str, local_port: u16) {
        for plugin in self.plugins.iter().filter(|p| p.enabled()) {
            plugin.on_connect(subdomain, local_port);
        }
    }

    pub fn on_disconnect(&self, subdomain: &str, reason: &str) {
        for plugin in self.plugins.iter().filter(|p| p.enabled()) {
            plugin.on_disconnect(subdomain, reason);
        }
    }
}

/// Merges `overlay`'s top-level keys onto `base`, `overlay` winning on
/// conflicts. Used to fold plugin-contributed config onto the config file's.
pub fn merge_config(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            base_map.extend(overlay_map);
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Logs method/path/status/duration for every proxied request; correlates
/// the `onRequest`-observed subdomain with the later `after_proxy` call
/// through `RequestContext` rather than any plugin-local state.
pub struct RequestLogPlugin;

impl AgentPlugin for RequestLogPlugin {
    fn name(&self) -> &str {
        "request-log"
    }

    fn on_request(&self, subdomain: &str) {
        tracing::trace!(subdomain, "dispatching request");
    }

    fn after_proxy(&self, ctx: &RequestContext, status: u16, _headers: &mut HeaderMap) {
        tracing::info!(
            request_id = %ctx.request_id,
            subdomain = %ctx.subdomain,
            status,
            elapsed_ms = ctx.started_at.elapsed().as_millis(),
            "proxied request"
        );
    }
}

/// No-op plugin used to exercise hook ordering in tests.
pub struct PassthroughPlugin;

impl AgentPlugin for PassthroughPlugin {
    fn name(&self) -> &str {
        "passthrough"
    }
}

pub fn default_chain() -> PluginChain {
    PluginChain::new(vec![Box::new(RequestLogPlugin)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPlugin {
        calls: Arc<AtomicUsize>,
    }

    impl AgentPlugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }
        fn before_proxy(&self, _ctx: &RequestContext, _headers: &mut HeaderMap) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ConfigPlugin {
        key: &'static str,
        value: &'static str,
    }

    impl AgentPlugin for ConfigPlugin {
        fn name(&self) -> &str {
            self.key
        }
        fn worker_config(&self) -> Option<Value> {
            let mut map = Map::new();
            map.insert(self.key.to_string(), Value::String(self.value.to_string()));
            Some(Value::Object(map))
        }
    }

    #[test]
    fn chain_runs_every_enabled_plugin_in_registration_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = PluginChain::new(vec![
            Box::new(CountingPlugin { calls: calls.clone() }),
            Box::new(PassthroughPlugin),
            Box::new(CountingPlugin { calls: calls.clone() }),
        ]);
        let ctx = RequestContext {
            request_id: "r1".into(),
            subdomain: "abcd".into(),
            started_at: Instant::now(),
        };
        let mut headers = HeaderMap::new();
        chain.before_proxy(&ctx, &mut headers);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn worker_config_merges_with_later_plugins_winning() {
        let chain = PluginChain::new(vec![
            Box::new(ConfigPlugin { key: "a", value: "first" }),
            Box::new(ConfigPlugin { key: "a", value: "second" }),
            Box::new(ConfigPlugin { key: "b", value: "only" }),
        ]);
        let config = chain.worker_config();
        assert_eq!(config["a"], "second");
        assert_eq!(config["b"], "only");
    }

    #[test]
    fn merge_config_lets_overlay_win_on_conflicting_keys() {
        let base = serde_json::json!({"a": "from-file", "c": "from-file"});
        let overlay = serde_json::json!({"a": "from-plugin", "b": "from-plugin"});
        let merged = merge_config(base, overlay);
        assert_eq!(merged["a"], "from-plugin");
        assert_eq!(merged["b"], "from-plugin");
        assert_eq!(merged["c"], "from-file");
    }
}
