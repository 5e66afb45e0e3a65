//! tests/common/harness.rs
//!
//! A comprehensive test harness for creating and managing test clusters.
//! This module provides the building blocks for all integration and
//! component tests, abstracting away the boilerplate of:
//! - Generating a shared TLS trust domain for a test network.
//! - Creating a temporary `certs/` directory for each node.
//! - Spawning nodes in the background.
//! - Managing graceful shutdown.
//! - Connecting WebSocket clients to observe node state.

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use quorum_ring::{api::protocol::NetworkSnapshot, config::VisualizerConfig, domain::Address, kv::KvHandle, App, Config};
use rcgen::{Certificate, CertificateParams, DistinguishedName};
use std::{
    fs,
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    time::Duration,
};
use tempfile::{tempdir, TempDir};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Represents a shared private PKI for a test network: one CA, and a node
/// certificate signed by it per spawned node.
#[derive(Clone)]
pub struct CertSet {
    pub ca_cert_der: Vec<u8>,
    pub node_cert_der: Vec<u8>,
    pub node_key_der: Vec<u8>,
}

impl CertSet {
    /// Creates a file-system representation of the certificates in a directory.
    pub fn write_to_disk(&self, dir: &PathBuf) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join("ca.cert"), &self.ca_cert_der)?;
        fs::write(dir.join("node.cert"), &self.node_cert_der)?;
        fs::write(dir.join("node.key"), &self.node_key_der)?;
        Ok(())
    }
}

/// Generates a new, unique `CertSet` for a test network under `domain`.
pub fn generate_certs(domain: &str) -> CertSet {
    let ca_params = CertificateParams::new(vec![domain.to_string()]);
    let ca_cert = Certificate::from_params(ca_params).unwrap();
    let ca_cert_der = ca_cert.serialize_der().unwrap();

    let mut node_params = CertificateParams::new(vec![domain.to_string()]);
    node_params.distinguished_name = DistinguishedName::new();
    let node_cert = Certificate::from_params(node_params).unwrap();
    let node_cert_der = node_cert.serialize_der_with_signer(&ca_cert).unwrap();
    let node_key_der = node_cert.serialize_private_key_der();

    CertSet {
        ca_cert_der,
        node_cert_der,
        node_key_der,
    }
}

/// Tick timings tuned to run fast under test, while still respecting
/// `t_cleanup_ticks >= t_fail_ticks`.
fn test_config(identity: Address, introducer: Address, bind_addr: SocketAddr, bootstrap_peers: Vec<SocketAddr>, api_addr: SocketAddr) -> Config {
    Config {
        identity,
        introducer,
        bind_addr,
        bootstrap_peers,
        t_gossip_ticks: 1,
        t_fail_ticks: 4,
        t_cleanup_ticks: 6,
        gossip_proportion: 1.0,
        ring_size: 512,
        t_txn_ticks: 10,
        tick_interval_ms: 100,
        sender_equals_peer_reactivation: true,
        visualizer: Some(VisualizerConfig { bind_addr: api_addr }),
    }
}

/// A handle to a running node instance in a test environment.
pub struct TestNode {
    pub config: Config,
    pub bind_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub kv: KvHandle,
    pub shutdown_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Configures and spawns a new node in a background task.
    pub async fn spawn(identity: Address, introducer: Address, bootstrap_peers: Vec<SocketAddr>, certs: &CertSet) -> Result<Self> {
        let temp_dir = tempdir().context("Failed to create temp dir")?;
        let certs_dir = temp_dir.path().join("certs");
        certs.write_to_disk(&certs_dir).context("Failed to write certs to disk")?;

        let bind_addr = get_ephemeral_addr()?;
        let api_addr = get_ephemeral_addr()?;

        let config = test_config(identity, introducer, bind_addr, bootstrap_peers, api_addr);

        let app = App::new(config.clone()).context("Failed to create app")?;
        let kv = app.kv_handle();
        let shutdown_token = app.shutdown_token();
        let app_token = shutdown_token.clone();

        let app_dir = temp_dir.path().to_path_buf();
        tokio::spawn(async move {
            std::env::set_current_dir(&app_dir).expect("Failed to set current dir for spawned app");
            if let Err(e) = app.run().await {
                if !app_token.is_cancelled() {
                    tracing::error!(error = ?e, "Test node app failed");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        info!(%bind_addr, %api_addr, "Spawned test node");

        std::env::set_current_dir(std::env::var("CARGO_MANIFEST_DIR").unwrap()).unwrap();

        Ok(Self {
            config,
            bind_addr,
            api_addr,
            kv,
            shutdown_token,
            _temp_dir: temp_dir,
        })
    }

    /// Creates a WebSocket client connected to this node's visualizer API.
    pub async fn ws_client(&self) -> Result<WebSocketStream<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>> {
        let url = format!("ws://{}/ws", self.api_addr);
        let mut request = url.into_client_request()?;
        request.headers_mut().append("Host", self.api_addr.to_string().parse()?);

        let (socket, _) = connect_async(request).await.context("WebSocket connect failed")?;
        Ok(socket)
    }

    /// Shuts down the node gracefully.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

fn get_ephemeral_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

/// Polls a WebSocket client until `predicate` holds on a received snapshot,
/// or `timeout_duration` elapses.
pub async fn wait_for_snapshot<F>(
    ws_client: &mut WebSocketStream<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>,
    predicate: F,
    timeout_duration: Duration,
) -> Result<NetworkSnapshot>
where
    F: Fn(&NetworkSnapshot) -> bool,
{
    let wait = tokio::time::timeout(timeout_duration, async {
        loop {
            let msg = ws_client
                .next()
                .await
                .context("WebSocket stream ended prematurely")?
                .context("WebSocket message error")?;

            if let Message::Text(text) = msg {
                if let Ok(snapshot) = serde_json::from_str::<NetworkSnapshot>(&text) {
                    if predicate(&snapshot) {
                        return Ok(snapshot);
                    }
                }
            }
        }
    });

    wait.await.context("Timeout while waiting for state condition")?
}
