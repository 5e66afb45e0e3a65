//! src/kv/stabilization.rs
//!
//! Re-replication after the ring changes (§4.5): whenever this node's
//! two-successor neighbourhood shifts, every key it holds is re-pushed to
//! its (possibly new) secondary and tertiary replicas so the 3-replica
//! invariant (I2) is restored without a full rescan of the ring.
//!
//! All traffic this produces uses transaction id `-1` (see
//! `kv::server::handle_request`): it is never logged and never replied to.

use crate::domain::{Address, ReplicaRole};
use crate::kv::ring::Ring;
use crate::kv::server::KvServer;
use crate::kv::wire::KvMessage;

const STABILIZATION_TRANS_ID: i64 = -1;

/// One piece of re-replication traffic to send: `to` should receive
/// `message` on the KV channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: Address,
    pub message: KvMessage,
}

/// Computes the re-replication messages for every locally held key whose
/// *new primary is this node* (§4.5), now that this node's two-successor
/// neighbourhood has moved from `old_successors` to `new_successors`. Keys
/// for which this node is not the new primary are left untouched: some
/// other node is primary for them and will handle their replication.
pub fn stabilize(
    server: &mut KvServer,
    identity: Address,
    ring: &Ring,
    ring_size: u64,
    old_successors: [Address; 2],
    new_successors: [Address; 2],
) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    let Some(my_idx) = ring.position_of(identity) else {
        return outbound;
    };
    let keys: Vec<String> = server.keys().cloned().collect();

    for key in keys {
        if !ring.is_primary(&key, my_idx, ring_size) {
            continue;
        }

        let old_role = server.role(&key);
        server.set_role(&key, ReplicaRole::Primary);
        let Some(value) = server.value(&key).map(str::to_string) else {
            continue;
        };

        match old_role {
            Some(ReplicaRole::Tertiary) => {
                outbound.push(create_msg(identity, &key, &value, new_successors[0], ReplicaRole::Secondary));
                outbound.push(create_msg(identity, &key, &value, new_successors[1], ReplicaRole::Tertiary));
            }
            Some(ReplicaRole::Secondary) => {
                if new_successors[0] == old_successors[0] {
                    outbound.push(update_msg(identity, &key, &value, new_successors[0], ReplicaRole::Secondary));
                } else {
                    outbound.push(create_msg(identity, &key, &value, new_successors[0], ReplicaRole::Secondary));
                }
                outbound.push(create_msg(identity, &key, &value, new_successors[1], ReplicaRole::Tertiary));
            }
            // Already primary (or role unknown, which only happens for a
            // just-created local key): three shift cases from §4.5.
            _ => {
                if new_successors[0] == old_successors[1] {
                    outbound.push(update_msg(identity, &key, &value, new_successors[0], ReplicaRole::Secondary));
                    outbound.push(create_msg(identity, &key, &value, new_successors[1], ReplicaRole::Tertiary));
                } else if new_successors[0] == old_successors[0] {
                    if new_successors[1] != old_successors[1] {
                        outbound.push(create_msg(identity, &key, &value, new_successors[1], ReplicaRole::Tertiary));
                    }
                } else {
                    outbound.push(create_msg(identity, &key, &value, new_successors[0], ReplicaRole::Secondary));
                    outbound.push(create_msg(identity, &key, &value, new_successors[1], ReplicaRole::Tertiary));
                }
            }
        }
    }

    outbound
}

fn create_msg(identity: Address, key: &str, value: &str, to: Address, role: ReplicaRole) -> Outbound {
    Outbound {
        to,
        message: KvMessage::Create {
            trans_id: STABILIZATION_TRANS_ID,
            from: identity,
            key: key.to_string(),
            value: value.to_string(),
            role,
        },
    }
}

fn update_msg(identity: Address, key: &str, value: &str, to: Address, role: ReplicaRole) -> Outbound {
    Outbound {
        to,
        message: KvMessage::Update {
            trans_id: STABILIZATION_TRANS_ID,
            from: identity,
            key: key.to_string(),
            value: value.to_string(),
            role,
        },
    }
}
