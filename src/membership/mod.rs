//! src/membership/mod.rs
//!
//! The membership detector: maintains this node's eventually-consistent view
//! of cluster membership via heartbeat accounting, gossip fan-out, and
//! timeout-based suspicion/cleanup (§4.1). Time is counted in logical ticks,
//! advanced once per `tokio::time::interval` firing, rather than wall-clock
//! milliseconds — the ageing constants in `Config` (`t_fail_ticks` etc.) are
//! tick counts, exactly as specified.

pub mod protocol;
pub mod wire;

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::domain::Address;
use crate::transport::{Channel, ConnectionEvent, InboundMessage, TransportCommand};
use wire::{GossipEntry, MembershipMessage};

/// One row of the membership table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipEntry {
    pub address: Address,
    pub heartbeat: i64,
    pub local_timestamp: i64,
}

/// An insertion-ordered membership list plus an address→index side map, as
/// specified in §3. Self is always present.
#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    entries: Vec<MembershipEntry>,
    index: HashMap<Address, usize>,
}

impl MembershipTable {
    pub fn new(self_addr: Address, now: i64) -> Self {
        let mut table = Self {
            entries: Vec::new(),
            index: HashMap::new(),
        };
        table.insert(self_addr, 0, now);
        table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.index.contains_key(&addr)
    }

    pub fn get(&self, addr: Address) -> Option<&MembershipEntry> {
        self.index.get(&addr).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &MembershipEntry> {
        self.entries.iter()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.iter().map(|e| e.address).collect()
    }

    /// Inserts a new entry. No-ops if the address is already present —
    /// mirrors the source's `addMembershipEntry`, which is only ever called
    /// for addresses not yet known.
    pub fn insert(&mut self, addr: Address, heartbeat: i64, now: i64) {
        if self.index.contains_key(&addr) {
            return;
        }
        self.index.insert(addr, self.entries.len());
        self.entries.push(MembershipEntry {
            address: addr,
            heartbeat,
            local_timestamp: now,
        });
    }

    /// Replaces the heartbeat and timestamp of an existing entry.
    pub fn update_heartbeat(&mut self, addr: Address, heartbeat: i64, now: i64) {
        if let Some(&i) = self.index.get(&addr) {
            self.entries[i].heartbeat = heartbeat;
            self.entries[i].local_timestamp = now;
        }
    }

    /// Drops every entry (other than `self_addr`) whose timestamp is older
    /// than `t_cleanup_ticks`, rebuilding the index afterwards. Returns the
    /// addresses removed, for logging.
    pub fn evict_stale(&mut self, self_addr: Address, now: i64, t_cleanup_ticks: i64) -> Vec<Address> {
        let mut kept = Vec::with_capacity(self.entries.len());
        let mut removed = Vec::new();

        for entry in self.entries.drain(..) {
            if entry.address == self_addr || now - entry.local_timestamp <= t_cleanup_ticks {
                kept.push(entry);
            } else {
                removed.push(entry.address);
            }
        }

        self.entries = kept;
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.address, i))
            .collect();
        removed
    }
}

/// A read-only snapshot of the membership table, published on every change
/// for the KV layer (ring construction) and the visualizer to consume.
/// Carries the sockets learned for each member alongside the table itself,
/// since the KV layer needs to dial ring peers it may never have gossiped
/// with directly.
#[derive(Debug, Clone, Default)]
pub struct MembershipSnapshot {
    pub entries: Vec<MembershipEntry>,
    pub sockets: HashMap<Address, SocketAddr>,
}

/// The membership detector actor.
pub struct MembershipDetector {
    identity: Address,
    introducer: Address,
    bootstrap_peers: Vec<SocketAddr>,

    t_gossip_ticks: i64,
    t_fail_ticks: i64,
    t_cleanup_ticks: i64,
    gossip_proportion: f64,
    tick_interval_ms: u64,
    sender_equals_peer_reactivation: bool,

    table: MembershipTable,
    in_group: bool,
    ping_counter: i64,
    now: i64,
    /// Sockets learned from inbound traffic, keyed by the peer's logical
    /// address. A gossip target can only be reached once we've learned its
    /// socket this way — exactly the peers we've directly communicated with.
    peer_sockets: HashMap<Address, SocketAddr>,

    inbound_rx: mpsc::Receiver<InboundMessage>,
    conn_event_rx: mpsc::Receiver<ConnectionEvent>,
    transport_tx: mpsc::Sender<TransportCommand>,
    snapshot_tx: watch::Sender<MembershipSnapshot>,
}

impl MembershipDetector {
    pub fn new(
        config: &Config,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        conn_event_rx: mpsc::Receiver<ConnectionEvent>,
        transport_tx: mpsc::Sender<TransportCommand>,
        snapshot_tx: watch::Sender<MembershipSnapshot>,
    ) -> Self {
        let table = MembershipTable::new(config.identity, 0);
        let in_group = config.identity == config.introducer;

        Self {
            identity: config.identity,
            introducer: config.introducer,
            bootstrap_peers: config.bootstrap_peers.clone(),
            t_gossip_ticks: config.t_gossip_ticks as i64,
            t_fail_ticks: config.t_fail_ticks as i64,
            t_cleanup_ticks: config.t_cleanup_ticks as i64,
            gossip_proportion: config.gossip_proportion,
            tick_interval_ms: config.tick_interval_ms,
            sender_equals_peer_reactivation: config.sender_equals_peer_reactivation,
            table,
            in_group,
            ping_counter: config.t_gossip_ticks as i64,
            now: 0,
            peer_sockets: HashMap::new(),
            inbound_rx,
            conn_event_rx,
            transport_tx,
            snapshot_tx,
        }
    }

    pub async fn run(mut self, shutdown_token: CancellationToken) {
        tracing::info!(identity = %self.identity, "Membership detector started");

        if self.in_group {
            tracing::info!("Starting up group as introducer");
        } else {
            self.send_join_request().await;
        }
        self.publish_snapshot();

        let mut tick_timer = time::interval(std::time::Duration::from_millis(self.tick_interval_ms));

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Membership detector received shutdown signal.");
                    break;
                },
                _ = tick_timer.tick() => {
                    self.on_tick().await;
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound).await;
                },
                Some(_event) = self.conn_event_rx.recv() => {
                    // Connection-level events don't affect membership state directly;
                    // liveness is purely timeout-driven per §4.1.
                },
                else => {
                    tracing::info!("Channels closed. Membership detector shutting down.");
                    break;
                }
            }
        }
    }

    async fn send_join_request(&mut self) {
        let Some(&introducer_socket) = self.bootstrap_peers.first() else {
            tracing::warn!("No bootstrap peer configured; cannot reach introducer");
            return;
        };
        tracing::info!(introducer = %self.introducer, "Trying to join...");
        let msg = MembershipMessage::JoinRequest {
            from: self.identity,
            heartbeat: self.own_heartbeat(),
        };
        self.send_to(introducer_socket, msg).await;
    }

    async fn handle_inbound(&mut self, inbound: InboundMessage) {
        if inbound.channel != Channel::Membership {
            return;
        }
        let message = match MembershipMessage::decode(&inbound.payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, peer = %inbound.peer_addr, "Dropping malformed membership frame");
                return;
            }
        };

        self.peer_sockets.insert(message.sender(), inbound.peer_addr);

        match message {
            MembershipMessage::JoinReply { from, heartbeat } => {
                self.in_group = true;
                tracing::info!(from = %from, "Received reply for join request");
                self.table.insert(from, heartbeat, self.now);
                self.publish_snapshot();
            }
            MembershipMessage::JoinRequest { from, heartbeat } => {
                self.increment_own_heartbeat();
                let reply = MembershipMessage::JoinReply {
                    from: self.identity,
                    heartbeat: self.own_heartbeat(),
                };
                self.send_to(inbound.peer_addr, reply).await;
                tracing::info!(from = %from, "Sending reply message for join request");
                self.table.insert(from, heartbeat, self.now);
                self.publish_snapshot();
            }
            MembershipMessage::Gossip { from, entries } => {
                let mut changed = false;
                for entry in entries {
                    let gossip_entry = GossipEntry {
                        address: entry.address,
                        heartbeat: entry.heartbeat,
                    };
                    if protocol::merge_gossip_entry(
                        &mut self.table,
                        self.identity,
                        from,
                        gossip_entry,
                        self.now,
                        self.t_fail_ticks,
                        self.sender_equals_peer_reactivation,
                    ) {
                        changed = true;
                    }
                }
                if changed {
                    self.publish_snapshot();
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.now += 1;

        if !self.in_group {
            return;
        }

        if self.ping_counter == 0 {
            self.increment_own_heartbeat();
            self.gossip().await;
            self.ping_counter = self.t_gossip_ticks;
        } else {
            self.ping_counter -= 1;
        }

        let removed = self.table.evict_stale(self.identity, self.now, self.t_cleanup_ticks);
        if !removed.is_empty() {
            for addr in &removed {
                tracing::info!(event = "node_removed", addr = %addr, time = self.now);
                self.peer_sockets.remove(addr);
            }
            self.publish_snapshot();
        }
    }

    fn own_heartbeat(&self) -> i64 {
        self.table.get(self.identity).map(|e| e.heartbeat).unwrap_or(0)
    }

    fn increment_own_heartbeat(&mut self) {
        let next = self.own_heartbeat() + 1;
        self.table.update_heartbeat(self.identity, next, self.now);
    }

    async fn gossip(&mut self) {
        let active = protocol::active_entries(&self.table, self.now, self.t_fail_ticks);
        let targets = protocol::select_gossip_targets(&active, self.identity, self.gossip_proportion);

        if targets.is_empty() {
            tracing::debug!("No gossip targets this round.");
            return;
        }

        let entries: Vec<GossipEntry> = active
            .iter()
            .map(|e| GossipEntry {
                address: e.address,
                heartbeat: e.heartbeat,
            })
            .collect();
        let msg = MembershipMessage::Gossip {
            from: self.identity,
            entries,
        };
        let payload = msg.encode();

        for addr in targets {
            let Some(&socket) = self.peer_sockets.get(&addr) else {
                continue;
            };
            tracing::trace!(peer = %addr, "Sending gossip message");
            let command = TransportCommand::Send(socket, Channel::Membership, payload.clone());
            if let Err(e) = self.transport_tx.send(command).await {
                tracing::error!(error = %e, "Failed to send gossip to transport service");
            }
        }
    }

    async fn send_to(&self, socket: SocketAddr, message: MembershipMessage) {
        let command = TransportCommand::Send(socket, Channel::Membership, message.encode());
        if let Err(e) = self.transport_tx.send(command).await {
            tracing::error!(error = %e, "Failed to send command to transport service");
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = MembershipSnapshot {
            entries: self.table.iter().cloned().collect(),
            sockets: self.peer_sockets.clone(),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }
}
