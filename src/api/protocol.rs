//! src/api/protocol.rs
//!
//! Defines the data contract for the visualizer's WebSocket API: a single
//! `NetworkSnapshot` combining this node's membership view, its slice of the
//! consistent-hash ring, and a summary of the keys it holds locally (§4.7).

use serde::{Deserialize, Serialize};

use crate::domain::{Address, ReplicaRole};

/// The full state pushed to a connected visualizer client, both on initial
/// connection and on every subsequent change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub self_addr: Option<Address>,
    pub members: Vec<MemberView>,
    pub ring: Vec<RingNodeView>,
    pub local_keys: Vec<KeySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberView {
    pub address: Address,
    pub heartbeat: i64,
    pub local_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingNodeView {
    pub address: Address,
    pub hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySummary {
    pub key: String,
    pub role: ReplicaRole,
}
