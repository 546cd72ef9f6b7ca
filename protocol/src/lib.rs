//! # Tunnel Wire Protocol
//!
//! Defines the JSON envelope exchanged between the edge relay and an agent
//! over the single long-lived control WebSocket, plus the header and body
//! encoding helpers both ends use to translate envelopes to/from real HTTP
//! and WebSocket traffic.
//!
//! The enum here **must stay in sync** across the edge and the agent — both
//! depend on this crate rather than maintaining their own copy.

pub mod body;
pub mod envelope;
pub mod headers;

pub use envelope::Envelope;
pub use headers::HeaderMap;
