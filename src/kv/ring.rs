//! src/kv/ring.rs
//!
//! The consistent-hash ring over the live membership (§4.2): construction,
//! key placement, the primary test, and neighbourhood (predecessor/successor)
//! computation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::domain::Address;

/// One position on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingNode {
    pub address: Address,
    pub hash: u64,
}

/// The sorted ring of live members, rebuilt whenever membership changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ring {
    nodes: Vec<RingNode>,
}

fn hash_bytes(bytes: &[u8], ring_size: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish() % ring_size
}

impl Ring {
    /// Builds a ring from the current membership addresses, sorted by hash
    /// (ties broken by address).
    pub fn build(addresses: &[Address], ring_size: u64) -> Self {
        let mut nodes: Vec<RingNode> = addresses
            .iter()
            .map(|&address| RingNode {
                address,
                hash: hash_bytes(&address.to_bytes(), ring_size),
            })
            .collect();
        nodes.sort_by(|a, b| a.hash.cmp(&b.hash).then(a.address.cmp(&b.address)));
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    pub fn position_of(&self, address: Address) -> Option<usize> {
        self.nodes.iter().position(|n| n.address == address)
    }

    /// Hashes a key to its ring position.
    pub fn hash_key(&self, key: &str, ring_size: u64) -> u64 {
        hash_bytes(key.as_bytes(), ring_size)
    }

    /// Finds the three replicas responsible for `key` (§4.2). Empty if the
    /// ring has fewer than 3 members.
    pub fn find_replicas(&self, key: &str, ring_size: u64) -> Vec<Address> {
        if self.nodes.len() < 3 {
            return Vec::new();
        }
        let pos = self.hash_key(key, ring_size);

        let first = self.nodes[0];
        let last = self.nodes[self.nodes.len() - 1];
        if pos <= first.hash || pos > last.hash {
            return vec![self.nodes[0].address, self.nodes[1].address, self.nodes[2].address];
        }

        for i in 1..self.nodes.len() {
            if pos <= self.nodes[i].hash {
                let n = self.nodes.len();
                return vec![
                    self.nodes[i].address,
                    self.nodes[(i + 1) % n].address,
                    self.nodes[(i + 2) % n].address,
                ];
            }
        }
        // Unreachable given the pos <= last.hash guard above, but fall back
        // to the wrap-around case rather than panicking.
        vec![self.nodes[0].address, self.nodes[1].address, self.nodes[2].address]
    }

    /// Tests whether the node at ring index `my_idx` is the primary for `key`.
    pub fn is_primary(&self, key: &str, my_idx: usize, ring_size: u64) -> bool {
        let key_hash = self.hash_key(key, ring_size);
        let my_hash = self.nodes[my_idx].hash;

        if my_idx == 0 {
            let end_hash = self.nodes[self.nodes.len() - 1].hash;
            key_hash <= my_hash || key_hash > end_hash
        } else {
            let prev_hash = self.nodes[my_idx - 1].hash;
            key_hash > prev_hash && key_hash <= my_hash
        }
    }

    /// Computes the two predecessors and two successors of the node at
    /// `my_pos`, wrapping around the ring.
    pub fn neighbourhood(&self, my_pos: usize) -> ([Address; 2], [Address; 2]) {
        let n = self.nodes.len() as i64;
        let idx = |p: i64| -> usize { p.rem_euclid(n) as usize };

        let predecessors = [
            self.nodes[idx(my_pos as i64 - 2)].address,
            self.nodes[idx(my_pos as i64 - 1)].address,
        ];
        let successors = [
            self.nodes[idx(my_pos as i64 + 1)].address,
            self.nodes[idx(my_pos as i64 + 2)].address,
        ];
        (predecessors, successors)
    }
}
