//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::domain::Address;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// This node's own address.
    pub identity: Address,
    /// The well-known introducer every node bootstraps through.
    pub introducer: Address,
    pub bind_addr: SocketAddr,
    pub bootstrap_peers: Vec<SocketAddr>,

    /// Gossip period, in ticks.
    pub t_gossip_ticks: u64,
    /// Ticks after which a peer is no longer gossiped about or heartbeat-updated.
    pub t_fail_ticks: u64,
    /// Ticks after which a stale entry is dropped from the membership table.
    pub t_cleanup_ticks: u64,
    /// Fraction of the active set gossiped to each round.
    pub gossip_proportion: f64,

    /// Ring modulus `R`.
    pub ring_size: u64,
    /// Per-transaction timeout, in ticks.
    pub t_txn_ticks: u64,

    /// Wall-clock duration of one logical tick.
    pub tick_interval_ms: u64,

    /// §9: whether the gossip merge rule also accepts a heartbeat update
    /// for an expired entry when the sender is that peer itself.
    pub sender_equals_peer_reactivation: bool,

    pub visualizer: Option<VisualizerConfig>,
}

/// Configuration for the optional visualizer web server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizerConfig {
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Loads configuration from `config.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("RING_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: Address::new(1, 0),
            introducer: Address::INTRODUCER,
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000),
            bootstrap_peers: Vec::new(),
            t_gossip_ticks: 2,
            t_fail_ticks: 10,
            t_cleanup_ticks: 20,
            gossip_proportion: 0.5,
            ring_size: 512,
            t_txn_ticks: 10,
            tick_interval_ms: 1000,
            sender_equals_peer_reactivation: true,
            visualizer: None,
        }
    }
}
