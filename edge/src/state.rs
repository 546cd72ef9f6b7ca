//! # Mux State
//!
//! Holds the shared application state for the edge relay: three index
//! tables (agent sockets by subdomain, visitor sockets by session id,
//! pending HTTP requests by request id) plus the tunnel store.
//!
//! All registries use [`DashMap`] for lock-free concurrent access. Each
//! handler does its read-modify-write on one key within a single
//! `.await`-free critical section (DashMap's per-shard locking), giving
//! per-key run-to-completion semantics without an explicit actor.

use crate::pipeline::{ConfigCache, MiddlewareChain};
use crate::store::TunnelStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tunnel_protocol::Envelope;

/// Everything an axum handler needs, grouped into one `Clone`-cheap value
/// for use as router state.
#[derive(Clone)]
pub struct EdgeState {
    pub mux: Arc<Mux>,
    pub config_cache: Arc<ConfigCache>,
    pub middlewares: Arc<MiddlewareChain>,
}

impl EdgeState {
    pub fn new(store: Arc<dyn TunnelStore>) -> Self {
        Self {
            mux: Mux::new(store),
            config_cache: Arc::new(ConfigCache::new()),
            middlewares: Arc::new(MiddlewareChain::default()),
        }
    }
}

/// Outbound channel to a connected agent's WebSocket write half.
pub type AgentTx = mpsc::UnboundedSender<AgentOutbound>;
/// Outbound channel to a connected visitor WebSocket write half.
pub type VisitorTx = mpsc::UnboundedSender<VisitorOutbound>;

/// What the agent-socket writer task knows how to send.
#[derive(Debug, Clone)]
pub enum AgentOutbound {
    Message(Envelope),
    /// A literal non-JSON text frame — used only for the `"pong"` liveness
    /// reply, which the wire protocol deliberately keeps outside the
    /// tagged envelope union.
    RawText(String),
    Close { code: u16, reason: String },
}

/// What the visitor-socket writer task knows how to send: either a raw
/// proxied frame or a close instruction, since visitor sockets also need a
/// distinguishable "close with code/reason" command.
#[derive(Debug, Clone)]
pub enum VisitorOutbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Attachment persisted alongside an accepted agent WebSocket — the single
/// source of truth for rebuilding the agent table on a cold start.
#[derive(Debug, Clone)]
pub struct AgentSocket {
    pub subdomain: String,
    pub tx: AgentTx,
}

/// Attachment persisted alongside an accepted visitor WebSocket.
#[derive(Debug, Clone)]
pub struct VisitorSocket {
    pub session_id: String,
    pub subdomain: String,
    pub tx: VisitorTx,
}

/// Edge-side bookkeeping for one in-flight visitor HTTP request awaiting
/// its `http-response`, removed exactly once by whichever of
/// {response, timeout, tunnel-close, send-failure} happens first.
pub struct PendingRequest {
    pub subdomain: String,
    pub resolver: Option<oneshot::Sender<PendingOutcome>>,
}

#[derive(Debug)]
pub enum PendingOutcome {
    Response {
        status: u16,
        headers: tunnel_protocol::HeaderMap,
        body: Vec<u8>,
    },
    TunnelDown,
}

/// The global mux actor: one instance serves every subdomain. A sharded
/// rewrite would split this by subdomain hash while keeping the per-shard
/// tables identical in shape.
pub struct Mux {
    pub agents: DashMap<String, AgentSocket>,
    pub visitors: DashMap<String, VisitorSocket>,
    pub pending: DashMap<String, PendingRequest>,
    pub store: Arc<dyn TunnelStore>,
}

impl Mux {
    pub fn new(store: Arc<dyn TunnelStore>) -> Arc<Self> {
        Arc::new(Self {
            agents: DashMap::new(),
            visitors: DashMap::new(),
            pending: DashMap::new(),
            store,
        })
    }

    /// Registers a new agent socket for `subdomain`, closing and evicting
    /// whatever was previously registered first. Returns the evicted
    /// socket's sender, if any, so the caller can send it a close frame
    /// *before* this returns: eviction always happens before the new
    /// registration becomes visible.
    pub fn register_agent(&self, subdomain: &str, socket: AgentSocket) -> Option<AgentTx> {
        let evicted = self.agents.remove(subdomain).map(|(_, old)| old.tx);
        self.agents.insert(subdomain.to_string(), socket);
        evicted
    }

    /// Tears down everything associated with a disconnected/errored agent
    /// socket for `subdomain`: removes it from the agent table, rejects
    /// every pending request for that subdomain, and closes every visitor
    /// socket attached to it.
    pub fn evict_agent(&self, subdomain: &str) -> (Vec<PendingRequest>, Vec<VisitorSocket>) {
        self.agents.remove(subdomain);

        let pending_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().subdomain == subdomain)
            .map(|e| e.key().clone())
            .collect();
        let mut rejected = Vec::with_capacity(pending_ids.len());
        for id in pending_ids {
            if let Some((_, req)) = self.pending.remove(&id) {
                rejected.push(req);
            }
        }

        let visitor_ids: Vec<String> = self
            .visitors
            .iter()
            .filter(|e| e.value().subdomain == subdomain)
            .map(|e| e.key().clone())
            .collect();
        let mut closed = Vec::with_capacity(visitor_ids.len());
        for id in visitor_ids {
            if let Some((_, v)) = self.visitors.remove(&id) {
                closed.push(v);
            }
        }

        (rejected, closed)
    }

    /// Removes a pending request, if still present, returning it so the
    /// caller can resolve its oneshot. A no-op if another path already won
    /// the race (response vs. timeout vs. tunnel-close).
    pub fn take_pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id).map(|(_, req)| req)
    }

    /// Snapshot used by the hibernation-restore path: reconstructs both
    /// index tables from a list of previously-accepted socket attachments.
    /// Real hibernation-capable runtimes call this on cold construction;
    /// this implementation emulates it since the bundled edge keeps its
    /// tables in-memory rather than relying on a platform restore hook.
    pub fn restore(&self, agents: Vec<AgentSocket>, visitors: Vec<VisitorSocket>) {
        for agent in agents {
            self.agents.insert(agent.subdomain.clone(), agent);
        }
        for visitor in visitors {
            self.visitors.insert(visitor.session_id.clone(), visitor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTunnelStore;

    fn mux() -> Arc<Mux> {
        Mux::new(Arc::new(InMemoryTunnelStore::new()))
    }

    fn agent_socket(subdomain: &str) -> (AgentSocket, mpsc::UnboundedReceiver<AgentOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            AgentSocket {
                subdomain: subdomain.to_string(),
                tx,
            },
            rx,
        )
    }

    #[test]
    fn reconnect_evicts_prior_agent_before_registering_new_one() {
        let mux = mux();
        let (old, _old_rx) = agent_socket("abcd");
        assert!(mux.register_agent("abcd", old).is_none());

        let (new, _new_rx) = agent_socket("abcd");
        let evicted = mux.register_agent("abcd", new);
        assert!(evicted.is_some());
        assert_eq!(mux.agents.len(), 1);
    }

    #[test]
    fn evict_agent_rejects_only_that_subdomains_pending_requests() {
        let mux = mux();
        let (tx_a, _rx_a) = oneshot::channel();
        mux.pending.insert(
            "req-1".into(),
            PendingRequest {
                subdomain: "abcd".into(),
                resolver: Some(tx_a),
            },
        );
        let (tx_b, _rx_b) = oneshot::channel();
        mux.pending.insert(
            "req-2".into(),
            PendingRequest {
                subdomain: "other".into(),
                resolver: Some(tx_b),
            },
        );

        let (rejected, _closed) = mux.evict_agent("abcd");
        assert_eq!(rejected.len(), 1);
        assert_eq!(mux.pending.len(), 1);
        assert!(mux.pending.contains_key("req-2"));
    }

    #[test]
    fn evict_agent_closes_only_that_subdomains_visitors() {
        let mux = mux();
        let (vtx, _vrx) = mpsc::unbounded_channel();
        mux.visitors.insert(
            "sess-1".into(),
            VisitorSocket {
                session_id: "sess-1".into(),
                subdomain: "abcd".into(),
                tx: vtx.clone(),
            },
        );
        mux.visitors.insert(
            "sess-2".into(),
            VisitorSocket {
                session_id: "sess-2".into(),
                subdomain: "other".into(),
                tx: vtx,
            },
        );

        let (_rejected, closed) = mux.evict_agent("abcd");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].session_id, "sess-1");
        assert!(mux.visitors.contains_key("sess-2"));
    }

    #[test]
    fn restore_rebuilds_both_tables_from_attachments() {
        let mux = mux();
        let (agent, _arx) = agent_socket("abcd");
        let (vtx, _vrx) = mpsc::unbounded_channel();
        let visitor = VisitorSocket {
            session_id: "sess-1".into(),
            subdomain: "abcd".into(),
            tx: vtx,
        };
        mux.restore(vec![agent], vec![visitor]);
        assert!(mux.agents.contains_key("abcd"));
        assert!(mux.visitors.contains_key("sess-1"));
    }

    #[test]
    fn take_pending_removes_at_most_once() {
        let mux = mux();
        let (tx, _rx) = oneshot::channel();
        mux.pending.insert(
            "req-1".into(),
            PendingRequest {
                subdomain: "abcd".into(),
                resolver: Some(tx),
            },
        );
        assert!(mux.take_pending("req-1").is_some());
        assert!(mux.take_pending("req-1").is_none());
    }
}
