//! src/kv/server.rs
//!
//! Server-side storage and per-message handling (§4.4): a local key/value
//! map plus a parallel map of replica-role metadata, and the four request
//! handlers that apply a request and produce the matching reply.
//!
//! A transaction id of `-1` marks a stabilization bypass message (§4.5):
//! those neither log an outcome nor produce a reply, matching the original
//! protocol's silent re-replication traffic.

use std::collections::HashMap;

use crate::domain::{Address, ReplicaRole};
use crate::kv::wire::KvMessage;

const STABILIZATION_TRANS_ID: i64 = -1;

/// The node's local share of the key space.
#[derive(Debug, Clone, Default)]
pub struct KvServer {
    store: HashMap<String, String>,
    roles: HashMap<String, ReplicaRole>,
}

impl KvServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.store.keys()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.store.get(key).map(String::as_str)
    }

    pub fn role(&self, key: &str) -> Option<ReplicaRole> {
        self.roles.get(key).copied()
    }

    pub fn set_role(&mut self, key: &str, role: ReplicaRole) {
        if let Some(r) = self.roles.get_mut(key) {
            *r = role;
        }
    }

    fn create(&mut self, key: String, value: String, role: ReplicaRole) -> bool {
        if self.store.contains_key(&key) {
            return false;
        }
        self.roles.insert(key.clone(), role);
        self.store.insert(key, value);
        true
    }

    fn read(&self, key: &str) -> Option<String> {
        self.store.get(key).cloned()
    }

    /// Updates an existing key's value in place. Deliberately does not touch
    /// `roles`: a node's replica role for a key changes only via CREATE or
    /// stabilization, never as a side effect of an UPDATE.
    fn update(&mut self, key: &str, value: String) -> bool {
        if let Some(slot) = self.store.get_mut(key) {
            *slot = value;
            true
        } else {
            false
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        self.roles.remove(key);
        self.store.remove(key).is_some()
    }
}

/// Applies an inbound request to `server`, returning the reply to send back
/// (`None` for a stabilization-bypass message, which is never replied to).
pub fn handle_request(server: &mut KvServer, identity: Address, message: KvMessage) -> Option<KvMessage> {
    let is_stabilization = message.trans_id() == STABILIZATION_TRANS_ID;
    let trans_id = message.trans_id();
    let coordinator = message.from();

    match message {
        KvMessage::Create { key, value, role, .. } => {
            let success = server.create(key.clone(), value.clone(), role);
            if !is_stabilization {
                tracing::info!(
                    event = "create", outcome = if success { "success" } else { "fail" },
                    is_coordinator = false, trans_id, key = %key,
                );
                Some(KvMessage::WriteReply { trans_id, from: identity, success })
            } else {
                None
            }
        }
        KvMessage::Update { key, value, .. } => {
            let success = server.update(&key, value.clone());
            if !is_stabilization {
                tracing::info!(
                    event = "update", outcome = if success { "success" } else { "fail" },
                    is_coordinator = false, trans_id, key = %key,
                );
                Some(KvMessage::WriteReply { trans_id, from: identity, success })
            } else {
                None
            }
        }
        KvMessage::Delete { key, .. } => {
            let success = server.delete(&key);
            if !is_stabilization {
                tracing::info!(
                    event = "delete", outcome = if success { "success" } else { "fail" },
                    is_coordinator = false, trans_id, key = %key,
                );
                Some(KvMessage::WriteReply { trans_id, from: identity, success })
            } else {
                None
            }
        }
        KvMessage::Read { key, .. } => {
            let found = server.read(&key);
            if !is_stabilization {
                tracing::info!(
                    event = "read", outcome = if found.is_some() { "success" } else { "fail" },
                    is_coordinator = false, trans_id, key = %key,
                );
                Some(KvMessage::ReadReply {
                    trans_id,
                    from: identity,
                    value: found.unwrap_or_default(),
                })
            } else {
                None
            }
        }
        // Replies are handled by the coordinator, never looped back here.
        KvMessage::WriteReply { .. } | KvMessage::ReadReply { .. } => {
            tracing::warn!(from = %coordinator, "Reply message routed to server handler, ignoring");
            None
        }
    }
}
