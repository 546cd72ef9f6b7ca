//! Resolution helpers for [`crate::state::PendingRequest`].
//!
//! A pending request's `oneshot::Sender` is consumed by whichever of
//! {response, timeout, tunnel-close, send-failure} wins the race; these
//! helpers make each of those call sites a one-liner and guarantee the
//! resolver is only ever used once (the `Option::take` inside `PendingRequest`
//! handles a caller accidentally calling twice).

use crate::state::{PendingOutcome, PendingRequest};
use tunnel_protocol::HeaderMap;

pub trait PendingOutcomeExt {
    fn resolve_response(self, status: u16, headers: HeaderMap, body: Vec<u8>);
    fn resolve_tunnel_down(self);
}

impl PendingOutcomeExt for PendingRequest {
    fn resolve_response(mut self, status: u16, headers: HeaderMap, body: Vec<u8>) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(PendingOutcome::Response { status, headers, body });
        }
    }

    fn resolve_tunnel_down(mut self) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(PendingOutcome::TunnelDown);
        }
    }
}
