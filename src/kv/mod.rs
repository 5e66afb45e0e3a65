//! src/kv/mod.rs
//!
//! The replicated key/value layer: a consistent-hash ring over the live
//! membership (`ring`), the quorum-seeking client coordinator
//! (`coordinator`), the per-node storage and request handlers (`server`),
//! and the re-replication algorithm that restores the 3-replica invariant
//! after a ring change (`stabilization`).
//!
//! `KvStore` is the actor tying these together: it rebuilds its ring from
//! the membership layer's published snapshot, dispatches inbound KV wire
//! traffic to the coordinator or the server as appropriate, and drives
//! stabilization and transaction-timeout sweeps from its own tick.

pub mod coordinator;
pub mod ring;
pub mod server;
pub mod stabilization;
pub mod transaction;
pub mod wire;

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::api::protocol::{KeySummary, MemberView, NetworkSnapshot, RingNodeView};
use crate::config::Config;
use crate::domain::Address;
use crate::membership::MembershipSnapshot;
use crate::transport::{Channel, InboundMessage, TransportCommand};
use coordinator::Coordinator;
use ring::Ring;
use server::KvServer;
use wire::KvMessage;

/// A client-facing request, issued from the API layer or a test harness.
pub enum KvCommand {
    Create { key: String, value: String, reply: oneshot::Sender<bool> },
    Read { key: String, reply: oneshot::Sender<Option<String>> },
    Update { key: String, value: String, reply: oneshot::Sender<bool> },
    Delete { key: String, reply: oneshot::Sender<bool> },
}

/// A cloneable client handle for issuing CREATE/READ/UPDATE/DELETE requests
/// against a running `KvStore` (§4.3). This is the Rust-native equivalent of
/// the external test-harness / application driver that drives client
/// workloads against the original system: it is not part of THE CORE, just
/// the thin typed wrapper a caller (the `main` binary, a test) uses to talk
/// to it.
#[derive(Clone)]
pub struct KvHandle {
    command_tx: mpsc::Sender<KvCommand>,
}

impl KvHandle {
    pub fn new(command_tx: mpsc::Sender<KvCommand>) -> Self {
        Self { command_tx }
    }

    pub async fn create(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = KvCommand::Create { key: key.into(), value: value.into(), reply };
        if self.command_tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn update(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = KvCommand::Update { key: key.into(), value: value.into(), reply };
        if self.command_tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn delete(&self, key: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = KvCommand::Delete { key: key.into(), reply };
        if self.command_tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn read(&self, key: impl Into<String>) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        let cmd = KvCommand::Read { key: key.into(), reply };
        if self.command_tx.send(cmd).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }
}

enum PendingReply {
    Write(oneshot::Sender<bool>),
    Read(oneshot::Sender<Option<String>>),
}

pub struct KvStore {
    identity: Address,
    ring_size: u64,
    t_txn_ticks: i64,
    tick_interval_ms: u64,

    ring: Ring,
    server: KvServer,
    coordinator: Coordinator,
    now: i64,

    /// Resolved once the ring first reaches 3+ members; used as the
    /// baseline for detecting a subsequent ring change.
    neighbourhood: Option<([Address; 2], [Address; 2])>,
    sockets: HashMap<Address, SocketAddr>,
    last_membership: Vec<crate::membership::MembershipEntry>,

    pending_client_replies: HashMap<i64, PendingReply>,

    command_rx: mpsc::Receiver<KvCommand>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    snapshot_rx: watch::Receiver<MembershipSnapshot>,
    transport_tx: mpsc::Sender<TransportCommand>,
    network_snapshot_tx: watch::Sender<NetworkSnapshot>,
}

impl KvStore {
    pub fn new(
        config: &Config,
        command_rx: mpsc::Receiver<KvCommand>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        snapshot_rx: watch::Receiver<MembershipSnapshot>,
        transport_tx: mpsc::Sender<TransportCommand>,
        network_snapshot_tx: watch::Sender<NetworkSnapshot>,
    ) -> Self {
        Self {
            identity: config.identity,
            ring_size: config.ring_size,
            t_txn_ticks: config.t_txn_ticks as i64,
            tick_interval_ms: config.tick_interval_ms,
            ring: Ring::default(),
            server: KvServer::new(),
            coordinator: Coordinator::new(config.identity),
            now: 0,
            neighbourhood: None,
            sockets: HashMap::new(),
            last_membership: Vec::new(),
            pending_client_replies: HashMap::new(),
            command_rx,
            inbound_rx,
            snapshot_rx,
            transport_tx,
            network_snapshot_tx,
        }
    }

    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(identity = %self.identity, "KV store started");

        let mut tick_timer = time::interval(std::time::Duration::from_millis(self.tick_interval_ms));

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("KV store received shutdown signal.");
                    break;
                },
                _ = tick_timer.tick() => {
                    self.on_tick().await;
                },
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound).await;
                },
                else => {
                    tracing::info!("Channels closed. KV store shutting down.");
                    break;
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.now += 1;
        self.reconcile_ring().await;

        let (expired_writes, expired_reads) = self.coordinator.sweep_expired(self.now, self.t_txn_ticks);
        for trans_id in expired_writes {
            self.resolve_write(trans_id, false);
        }
        for trans_id in expired_reads {
            self.resolve_read(trans_id, None);
        }
        self.publish_network_snapshot();
    }

    /// Builds and publishes the visualizer-facing snapshot (§4.7): the last
    /// seen membership view, the current ring, and a summary of locally
    /// held keys.
    fn publish_network_snapshot(&self) {
        let members = self
            .last_membership
            .iter()
            .map(|e| MemberView { address: e.address, heartbeat: e.heartbeat, local_timestamp: e.local_timestamp })
            .collect();
        let ring = self
            .ring
            .nodes()
            .iter()
            .map(|n| RingNodeView { address: n.address, hash: n.hash })
            .collect();
        let local_keys = self
            .server
            .keys()
            .filter_map(|k| self.server.role(k).map(|role| KeySummary { key: k.clone(), role }))
            .collect();

        let snapshot = NetworkSnapshot {
            self_addr: Some(self.identity),
            members,
            ring,
            local_keys,
        };
        let _ = self.network_snapshot_tx.send(snapshot);
    }

    async fn handle_command(&mut self, command: KvCommand) {
        match command {
            KvCommand::Create { key, value, reply } => {
                let out = self.coordinator.issue_create(&self.ring, self.ring_size, key, value, self.now);
                self.dispatch_write(out, reply).await;
            }
            KvCommand::Update { key, value, reply } => {
                let out = self.coordinator.issue_update(&self.ring, self.ring_size, key, value, self.now);
                self.dispatch_write(out, reply).await;
            }
            KvCommand::Delete { key, reply } => {
                let out = self.coordinator.issue_delete(&self.ring, self.ring_size, key, self.now);
                self.dispatch_write(out, reply).await;
            }
            KvCommand::Read { key, reply } => {
                let out = self.coordinator.issue_read(&self.ring, self.ring_size, key, self.now);
                if out.is_empty() {
                    let _ = reply.send(None);
                    return;
                }
                let trans_id = out[0].message.trans_id();
                self.pending_client_replies.insert(trans_id, PendingReply::Read(reply));
                for o in out {
                    self.send_kv(o.to, o.message).await;
                }
            }
        }
    }

    /// Writes share this shape: record the client's reply channel against
    /// the allocated transaction id (if the ring could resolve replicas at
    /// all) and fan the messages out.
    async fn dispatch_write(&mut self, out: Vec<coordinator::Outbound>, reply: oneshot::Sender<bool>) {
        if out.is_empty() {
            let _ = reply.send(false);
            return;
        }
        let trans_id = out[0].message.trans_id();
        self.pending_client_replies.insert(trans_id, PendingReply::Write(reply));
        for o in out {
            self.send_kv(o.to, o.message).await;
        }
    }

    async fn send_kv(&self, to: Address, message: KvMessage) {
        let Some(&socket) = self.sockets.get(&to) else {
            tracing::warn!(peer = %to, "No known socket for KV peer, dropping message");
            return;
        };
        let command = TransportCommand::Send(socket, Channel::Kv, message.encode().into_bytes());
        if let Err(e) = self.transport_tx.send(command).await {
            tracing::error!(error = %e, "Failed to send KV message to transport service");
        }
    }

    async fn handle_inbound(&mut self, inbound: InboundMessage) {
        if inbound.channel != Channel::Kv {
            return;
        }
        let text = match std::str::from_utf8(&inbound.payload) {
            Ok(t) => t,
            Err(_) => {
                tracing::warn!(peer = %inbound.peer_addr, "Dropping non-UTF8 KV frame");
                return;
            }
        };
        let message = match KvMessage::decode(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, peer = %inbound.peer_addr, "Dropping malformed KV frame");
                return;
            }
        };

        self.sockets.insert(message.from(), inbound.peer_addr);

        match message {
            KvMessage::WriteReply { trans_id, success, .. } => {
                if let Some(outcome) = self.coordinator.handle_write_reply(trans_id, success) {
                    self.resolve_write(trans_id, outcome);
                }
            }
            KvMessage::ReadReply { trans_id, value, .. } => {
                if let Some(outcome) = self.coordinator.handle_read_reply(trans_id, value) {
                    self.resolve_read(trans_id, outcome);
                }
            }
            request => {
                let from = request.from();
                if let Some(reply) = server::handle_request(&mut self.server, self.identity, request) {
                    self.send_kv(from, reply).await;
                }
                self.publish_network_snapshot();
            }
        }
    }

    fn resolve_write(&mut self, trans_id: i64, success: bool) {
        if let Some(PendingReply::Write(reply)) = self.pending_client_replies.remove(&trans_id) {
            let _ = reply.send(success);
        }
    }

    fn resolve_read(&mut self, trans_id: i64, value: Option<String>) {
        if let Some(PendingReply::Read(reply)) = self.pending_client_replies.remove(&trans_id) {
            let _ = reply.send(value);
        }
    }

    /// Rebuilds the ring from the latest membership snapshot and, if the
    /// neighbourhood moved, runs stabilization (§4.2, §4.5).
    async fn reconcile_ring(&mut self) {
        let snapshot = self.snapshot_rx.borrow_and_update().clone();
        self.sockets.extend(snapshot.sockets.clone());
        self.last_membership = snapshot.entries.clone();

        let addresses: Vec<Address> = snapshot.entries.iter().map(|e| e.address).collect();
        let new_ring = Ring::build(&addresses, self.ring_size);

        if new_ring.nodes() == self.ring.nodes() {
            return;
        }
        self.ring = new_ring;

        if self.ring.len() < 3 {
            self.neighbourhood = None;
            return;
        }

        let Some(my_pos) = self.ring.position_of(self.identity) else {
            tracing::error!("Self missing from own ring after rebuild");
            return;
        };
        let new_neighbourhood = self.ring.neighbourhood(my_pos);

        match self.neighbourhood.replace(new_neighbourhood) {
            None => {
                tracing::info!("Ring reached 3+ members; neighbourhood initialized without stabilization");
            }
            Some((_, old_successors)) if old_successors == new_neighbourhood.1 => {
                // Neighbourhood unchanged in the dimension stabilization cares about.
            }
            Some((_, old_successors)) => {
                if !self.server.is_empty() {
                    let outbound = stabilization::stabilize(
                        &mut self.server,
                        self.identity,
                        &self.ring,
                        self.ring_size,
                        old_successors,
                        new_neighbourhood.1,
                    );
                    tracing::info!(count = outbound.len(), "Running stabilization protocol");
                    for o in outbound {
                        self.send_kv(o.to, o.message).await;
                    }
                }
            }
        }
    }
}
