//! src/kv/coordinator.rs
//!
//! Client-facing coordinator (§4.3): turns a CREATE/READ/UPDATE/DELETE
//! request into one `KvMessage` per replica, tracks replies against a
//! per-transaction quorum, and times out transactions that never quorate.
//!
//! Transaction ids are allocated from a counter owned by this coordinator,
//! not a process-wide counter — each node hands out its own id space.

use std::collections::HashMap;

use crate::domain::{Address, ReplicaRole};
use crate::kv::ring::Ring;
use crate::kv::transaction::{ReadTxn, WriteKind, WriteTxn};
use crate::kv::wire::KvMessage;

/// One piece of coordinator-issued traffic: `to` should receive `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: Address,
    pub message: KvMessage,
}

pub struct Coordinator {
    identity: Address,
    next_trans_id: i64,
    pending_writes: HashMap<i64, WriteTxn>,
    pending_reads: HashMap<i64, ReadTxn>,
}

impl Coordinator {
    pub fn new(identity: Address) -> Self {
        Self {
            identity,
            next_trans_id: 0,
            pending_writes: HashMap::new(),
            pending_reads: HashMap::new(),
        }
    }

    fn allocate_trans_id(&mut self) -> i64 {
        let id = self.next_trans_id;
        self.next_trans_id += 1;
        id
    }

    /// Resolves `key`'s replicas on `ring` and fans out a write. Returns the
    /// empty vec (and records no transaction) if the ring has fewer than 3
    /// members, since there is no quorum to reach yet.
    fn issue_write(&mut self, ring: &Ring, ring_size: u64, key: String, value: Option<String>, kind: WriteKind, now: i64) -> Vec<Outbound> {
        let replicas = ring.find_replicas(&key, ring_size);
        if replicas.len() != 3 {
            return Vec::new();
        }
        let trans_id = self.allocate_trans_id();
        self.pending_writes.insert(trans_id, WriteTxn::new(key.clone(), value.clone(), kind, now));

        replicas
            .into_iter()
            .enumerate()
            .map(|(idx, to)| {
                let role = ReplicaRole::from_index(idx);
                let message = match kind {
                    WriteKind::Create => KvMessage::Create {
                        trans_id,
                        from: self.identity,
                        key: key.clone(),
                        value: value.clone().unwrap_or_default(),
                        role,
                    },
                    WriteKind::Update => KvMessage::Update {
                        trans_id,
                        from: self.identity,
                        key: key.clone(),
                        value: value.clone().unwrap_or_default(),
                        role,
                    },
                    WriteKind::Delete => KvMessage::Delete { trans_id, from: self.identity, key: key.clone() },
                };
                Outbound { to, message }
            })
            .collect()
    }

    pub fn issue_create(&mut self, ring: &Ring, ring_size: u64, key: String, value: String, now: i64) -> Vec<Outbound> {
        self.issue_write(ring, ring_size, key, Some(value), WriteKind::Create, now)
    }

    pub fn issue_update(&mut self, ring: &Ring, ring_size: u64, key: String, value: String, now: i64) -> Vec<Outbound> {
        self.issue_write(ring, ring_size, key, Some(value), WriteKind::Update, now)
    }

    pub fn issue_delete(&mut self, ring: &Ring, ring_size: u64, key: String, now: i64) -> Vec<Outbound> {
        self.issue_write(ring, ring_size, key, None, WriteKind::Delete, now)
    }

    pub fn issue_read(&mut self, ring: &Ring, ring_size: u64, key: String, now: i64) -> Vec<Outbound> {
        let replicas = ring.find_replicas(&key, ring_size);
        if replicas.len() != 3 {
            return Vec::new();
        }
        let trans_id = self.allocate_trans_id();
        self.pending_reads.insert(trans_id, ReadTxn::new(key.clone(), now));

        replicas
            .into_iter()
            .map(|to| Outbound {
                to,
                message: KvMessage::Read { trans_id, from: self.identity, key: key.clone() },
            })
            .collect()
    }

    /// Records a WRITE_REPLY, logging the quorum outcome exactly once, and
    /// drops the transaction once all three replies are in. Returns the
    /// outcome the first time quorum is reached, so a caller tracking a
    /// client-facing reply channel for this transaction knows when to
    /// resolve it.
    pub fn handle_write_reply(&mut self, trans_id: i64, success: bool) -> Option<bool> {
        let Some(txn) = self.pending_writes.get_mut(&trans_id) else {
            return None;
        };

        if success {
            txn.record_success();
        } else {
            txn.record_failure();
        }

        let mut outcome = None;
        if !txn.outcome_logged() {
            if txn.has_succeeded() {
                log_write_outcome(txn.kind, true, true, trans_id, &txn.key, txn.value.as_deref());
                txn.mark_outcome_logged();
                outcome = Some(true);
            } else if txn.has_failed() {
                log_write_outcome(txn.kind, false, true, trans_id, &txn.key, txn.value.as_deref());
                txn.mark_outcome_logged();
                outcome = Some(false);
            }
        }

        if txn.all_replies_received() {
            self.pending_writes.remove(&trans_id);
        }
        outcome
    }

    /// Records a READ_REPLY, logging the outcome exactly once a value
    /// reaches quorum: `READ FAIL` if the quorate value is the empty string
    /// (no replica held the key), `READ SUCCESS` with that value otherwise.
    /// Mirrors `handle_write_reply`: the transaction stays in `pending_reads`
    /// until all 3 replies are in, even after quorum is logged, so a late
    /// reply still has a transaction to record against.
    ///
    /// Returns `Some(outcome)` exactly once, the tick quorum is reached:
    /// `Some(Some(v))` on success, `Some(None)` on the empty-string fail
    /// case — both are terminal and should resolve any client-facing reply
    /// channel immediately rather than waiting for the timeout sweep.
    /// Returns `None` while the transaction is still waiting on replies.
    pub fn handle_read_reply(&mut self, trans_id: i64, value: String) -> Option<Option<String>> {
        let Some(txn) = self.pending_reads.get_mut(&trans_id) else {
            return None;
        };
        txn.record_value(value);

        let mut outcome = None;
        if !txn.quorum_logged() {
            if let Some(v) = txn.has_quorum().map(str::to_string) {
                let key = txn.key.clone();
                txn.mark_quorum_logged();
                if v.is_empty() {
                    tracing::info!(event = "read", outcome = "fail", is_coordinator = true, trans_id, key = %key);
                    outcome = Some(None);
                } else {
                    tracing::info!(event = "read", outcome = "success", is_coordinator = true, trans_id, key = %key, value = %v);
                    outcome = Some(Some(v));
                }
            }
        }

        if txn.all_replies_received() {
            self.pending_reads.remove(&trans_id);
        }
        outcome
    }

    /// Per-tick sweep (§4.3): any transaction past `t_txn_ticks` without a
    /// logged outcome is logged as a failure and dropped. Returns the ids of
    /// the write and read transactions that timed out, respectively, so a
    /// caller can resolve any pending client reply channel as a failure.
    pub fn sweep_expired(&mut self, now: i64, t_txn_ticks: i64) -> (Vec<i64>, Vec<i64>) {
        let expired_writes: Vec<i64> = self
            .pending_writes
            .iter()
            .filter(|(_, txn)| txn.has_expired(now, t_txn_ticks) && !txn.outcome_logged())
            .map(|(&id, _)| id)
            .collect();
        for &trans_id in &expired_writes {
            if let Some(txn) = self.pending_writes.remove(&trans_id) {
                log_write_outcome(txn.kind, false, true, trans_id, &txn.key, txn.value.as_deref());
            }
        }

        let expired_reads: Vec<i64> = self
            .pending_reads
            .iter()
            .filter(|(_, txn)| txn.has_expired(now, t_txn_ticks) && !txn.quorum_logged())
            .map(|(&id, _)| id)
            .collect();
        for &trans_id in &expired_reads {
            if let Some(txn) = self.pending_reads.remove(&trans_id) {
                tracing::info!(event = "read", outcome = "fail", is_coordinator = true, trans_id, key = %txn.key);
            }
        }

        (expired_writes, expired_reads)
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.len()
    }

    pub fn pending_read_count(&self) -> usize {
        self.pending_reads.len()
    }
}

fn log_write_outcome(kind: WriteKind, success: bool, is_coordinator: bool, trans_id: i64, key: &str, value: Option<&str>) {
    let event = match kind {
        WriteKind::Create => "create",
        WriteKind::Update => "update",
        WriteKind::Delete => "delete",
    };
    let outcome = if success { "success" } else { "fail" };
    match value {
        Some(v) => tracing::info!(event, outcome, is_coordinator, trans_id, key = %key, value = %v),
        None => tracing::info!(event, outcome, is_coordinator, trans_id, key = %key),
    }
}
