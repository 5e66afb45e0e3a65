//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the application's state
//! and manages the lifecycle of all its concurrent services.

use crate::{
    api::protocol::NetworkSnapshot,
    api::ApiServer,
    config::Config,
    error::Result,
    kv::{KvCommand, KvHandle, KvStore},
    membership::{MembershipDetector, MembershipSnapshot},
    transport::{ConnectionEvent, InboundMessage, Transport, TransportCommand},
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
    kv_command_tx: mpsc::Sender<KvCommand>,
    kv_command_rx: Option<mpsc::Receiver<KvCommand>>,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        let (kv_command_tx, kv_command_rx) = mpsc::channel::<KvCommand>(100);
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
            kv_command_tx,
            kv_command_rx: Some(kv_command_rx),
        })
    }

    /// A cloneable client handle for issuing CREATE/READ/UPDATE/DELETE
    /// requests against this node once it is running.
    pub fn kv_handle(&self) -> KvHandle {
        KvHandle::new(self.kv_command_tx.clone())
    }

    /// A token callers can use to request a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// The main run loop for the application.
    ///
    /// This function performs the following steps:
    ///   1. Creates the communication channels that link the services.
    ///   2. Spawns each service (`Transport`, `MembershipDetector`, `KvStore`,
    ///      `ApiServer`) in its own asynchronous Tokio task.
    ///   3. Waits for a shutdown signal (like Ctrl+C) and gracefully
    ///      terminates all tasks.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(identity = %self.config.identity, bind_addr = %self.config.bind_addr, "Starting node...");

        let kv_command_rx = self
            .kv_command_rx
            .take()
            .expect("App::run called more than once");

        // --- Create Communication Channels ---
        let (transport_command_tx, transport_command_rx) = mpsc::channel::<TransportCommand>(100);
        let (membership_inbound_tx, membership_inbound_rx) = mpsc::channel::<InboundMessage>(100);
        let (kv_inbound_tx, kv_inbound_rx) = mpsc::channel::<InboundMessage>(100);
        let (conn_event_tx, conn_event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let (membership_snapshot_tx, membership_snapshot_rx) = watch::channel(MembershipSnapshot::default());
        let (network_snapshot_tx, network_snapshot_rx) = watch::channel(NetworkSnapshot::default());

        // --- Instantiate and Spawn Services ---

        // Transport: The network I/O layer.
        let transport = Transport::new(
            self.config.bind_addr,
            self.config.bootstrap_peers.clone(),
            transport_command_rx,
            membership_inbound_tx,
            kv_inbound_tx,
            conn_event_tx,
        )?;
        let transport_task = tokio::spawn(transport.run(self.shutdown_token.clone()));
        tracing::debug!("Transport service spawned.");

        // Membership detector: heartbeats, gossip, suspicion/cleanup.
        let membership = MembershipDetector::new(
            &self.config,
            membership_inbound_rx,
            conn_event_rx,
            transport_command_tx.clone(),
            membership_snapshot_tx,
        );
        let membership_task = tokio::spawn(membership.run(self.shutdown_token.clone()));
        tracing::debug!("Membership detector spawned.");

        // KV store: ring, coordinator, server, stabilization.
        let kv_store = KvStore::new(
            &self.config,
            kv_command_rx,
            kv_inbound_rx,
            membership_snapshot_rx,
            transport_command_tx,
            network_snapshot_tx,
        );
        let kv_task = tokio::spawn(kv_store.run(self.shutdown_token.clone()));
        tracing::debug!("KV store spawned.");

        // API Server (optional).
        let api_task = if let Some(viz_config) = self.config.visualizer.clone() {
            tracing::info!("Visualizer is enabled. Starting API server.");
            let api_server = ApiServer::new(viz_config.bind_addr, network_snapshot_rx);
            let api_server_task = tokio::spawn(api_server.run(self.shutdown_token.clone()));
            Some(api_server_task)
        } else {
            None
        };

        // --- Wait for Shutdown Signal ---
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        // --- Await Service Termination ---
        self.shutdown_token.cancelled().await;

        // The tasks will complete once the shutdown token is cancelled.
        // We await them to ensure they finish cleanly.
        if let Err(e) = transport_task.await {
            tracing::error!(error = ?e, "Transport service task failed");
        }
        if let Err(e) = membership_task.await {
            tracing::error!(error = ?e, "Membership detector task failed");
        }
        if let Err(e) = kv_task.await {
            tracing::error!(error = ?e, "KV store task failed");
        }
        if let Some(task) = api_task {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "API server task failed");
            }
        }
        tracing::info!("Node has shut down gracefully.");

        Ok(())
    }
}
