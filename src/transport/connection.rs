//! src/transport/connection.rs
//!
//! Handles the logic for establishing, caching, and using QUIC connections.
//! Each message is a raw byte buffer prefixed with a one-byte channel tag so
//! the receiver can demultiplex without a second round of parsing.

use crate::{
    error::{Error, Result},
    transport::{Channel, ConnectionEvent, InboundMessage, MAX_MESSAGE_SIZE},
};
use quinn::{Connection, Endpoint};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, Mutex, Semaphore};

/// Establishes a connection to a peer and caches it.
pub async fn connect_to_peer(
    endpoint: Endpoint,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    peer_addr: SocketAddr,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
) -> Result<Connection> {
    let connecting = endpoint
        .connect(peer_addr, "localhost")
        .map_err(|e| Error::ConnectFailed(peer_addr, e))?;

    let conn = connecting
        .await
        .map_err(|e| Error::ConnectionEstablishFailed(peer_addr, e))?;

    tracing::info!(peer = %peer_addr, "Successfully connected to peer");

    let _ = conn_event_tx
        .send(ConnectionEvent::PeerConnected { peer_addr })
        .await;

    connections.lock().await.insert(peer_addr, conn.clone());
    Ok(conn)
}

/// Gets a cached connection or creates a new one.
async fn get_or_create_connection(
    endpoint: Endpoint,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    addr: SocketAddr,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
) -> Result<Connection> {
    let mut conns_guard = connections.lock().await;
    if let Some(conn) = conns_guard.get(&addr) {
        if conn.close_reason().is_none() {
            return Ok(conn.clone());
        }
        conns_guard.remove(&addr);
    }
    drop(conns_guard);
    connect_to_peer(endpoint, connections, addr, conn_event_tx).await
}

/// Sends a single channel-tagged message to a peer, using the connection cache.
pub async fn send_message_to_peer(
    endpoint: Endpoint,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    addr: SocketAddr,
    channel: Channel,
    payload: Vec<u8>,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let conn = get_or_create_connection(endpoint, connections, addr, conn_event_tx).await?;
    let mut send_stream = conn.open_uni().await?;

    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.push(channel.as_byte());
    framed.extend_from_slice(&payload);

    send_stream.write_all(&framed).await?;
    send_stream.finish().await?;
    tracing::trace!(peer = %addr, "Successfully sent message");
    Ok(())
}

/// Handles a single established QUIC connection, processing all incoming
/// streams and routing each to the membership or KV inbound channel per its
/// one-byte channel tag.
pub async fn handle_connection(
    conn: quinn::Connecting,
    connections: Arc<Mutex<HashMap<SocketAddr, Connection>>>,
    membership_inbound_tx: mpsc::Sender<InboundMessage>,
    kv_inbound_tx: mpsc::Sender<InboundMessage>,
    conn_event_tx: mpsc::Sender<ConnectionEvent>,
    stream_semaphore: Arc<Semaphore>,
) -> Result<()> {
    let connection = conn.await?;
    let peer_addr = connection.remote_address();
    tracing::info!(peer = %peer_addr, "Accepted connection from peer");

    let _ = conn_event_tx
        .send(ConnectionEvent::PeerConnected { peer_addr })
        .await;

    connections.lock().await.insert(peer_addr, connection.clone());

    loop {
        tokio::select! {
            stream = connection.accept_uni() => {
                match stream {
                    Ok(mut recv) => {
                        let membership_inbound_tx = membership_inbound_tx.clone();
                        let kv_inbound_tx = kv_inbound_tx.clone();
                        let permit = match stream_semaphore.clone().acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => {
                                tracing::warn!("Semaphore closed, cannot accept new streams.");
                                break Ok(());
                            }
                        };
                        tokio::spawn(async move {
                            match recv.read_to_end(MAX_MESSAGE_SIZE).await {
                                Ok(bytes) if bytes.is_empty() => {
                                    tracing::warn!(from = %peer_addr, "Received empty frame, dropping.");
                                }
                                Ok(bytes) => {
                                    match Channel::from_byte(bytes[0]) {
                                        Some(channel) => {
                                            let inbound = InboundMessage {
                                                peer_addr,
                                                channel,
                                                payload: bytes[1..].to_vec(),
                                            };
                                            let target = match channel {
                                                Channel::Membership => &membership_inbound_tx,
                                                Channel::Kv => &kv_inbound_tx,
                                            };
                                            if target.send(inbound).await.is_err() {
                                                tracing::warn!(?channel, "Inbound message channel is closed.");
                                            }
                                        }
                                        None => tracing::error!(from = %peer_addr, tag = bytes[0], "Unrecognized channel tag, dropping frame"),
                                    }
                                }
                                Err(e) => tracing::error!(from = %peer_addr, error = %e, "Failed to read from stream (potential DoS: exceeded size limit)"),
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer_addr, error = %e, "Stream acceptance failed");
                        break Ok(());
                    }
                }
            }
            reason = connection.closed() => {
                 tracing::info!(peer = %peer_addr, reason = %reason, "Connection closed");
                 let _ = conn_event_tx.send(ConnectionEvent::PeerDisconnected { peer_addr }).await;
                 connections.lock().await.remove(&peer_addr);
                 return Ok(());
            }
        }
    }
}
