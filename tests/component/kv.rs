//! tests/component/kv.rs
//!
//! In-memory component tests for the `KvStore` actor: quorum fan-out on a
//! client CREATE, and resolving the client reply once 2 of 3 replicas agree
//! (§4.3).

use quorum_ring::api::protocol::NetworkSnapshot;
use quorum_ring::config::Config;
use quorum_ring::domain::Address;
use quorum_ring::kv::wire::KvMessage;
use quorum_ring::kv::KvStore;
use quorum_ring::membership::{MembershipEntry, MembershipSnapshot};
use quorum_ring::transport::{Channel, InboundMessage, TransportCommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use test_log::test;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;

struct KvHarness {
    command_tx: mpsc::Sender<quorum_ring::kv::KvCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    transport_rx: mpsc::Receiver<TransportCommand>,
    membership_snapshot_tx: watch::Sender<MembershipSnapshot>,
    shutdown_token: CancellationToken,
}

fn socket_for(id: u32) -> SocketAddr {
    format!("127.0.0.1:{}", 7000 + id).parse().unwrap()
}

fn setup(config: Config) -> KvHarness {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let (transport_tx, transport_rx) = mpsc::channel(16);
    let (membership_snapshot_tx, membership_snapshot_rx) = watch::channel(MembershipSnapshot::default());
    let (network_snapshot_tx, _network_snapshot_rx) = watch::channel(NetworkSnapshot::default());

    let store = KvStore::new(&config, command_rx, inbound_rx, membership_snapshot_rx, transport_tx, network_snapshot_tx);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(store.run(shutdown_token.clone()));

    KvHarness {
        command_tx,
        inbound_tx,
        transport_rx,
        membership_snapshot_tx,
        shutdown_token,
    }
}

fn test_config() -> Config {
    Config {
        identity: Address::new(99, 0), // coordinator only, not a ring member
        ring_size: 512,
        t_txn_ticks: 3,
        tick_interval_ms: 10,
        ..Config::default()
    }
}

fn three_member_snapshot() -> MembershipSnapshot {
    let mut sockets = HashMap::new();
    let mut entries = Vec::new();
    for id in 1..=3 {
        let addr = Address::new(id, 0);
        sockets.insert(addr, socket_for(id));
        entries.push(MembershipEntry { address: addr, heartbeat: 0, local_timestamp: 0 });
    }
    MembershipSnapshot { entries, sockets }
}

async fn recv_decoded(transport_rx: &mut mpsc::Receiver<TransportCommand>) -> (SocketAddr, KvMessage) {
    let TransportCommand::Send(addr, channel, payload) = transport_rx.recv().await.unwrap();
    assert_eq!(channel, Channel::Kv);
    let text = String::from_utf8(payload).unwrap();
    (addr, KvMessage::decode(&text).unwrap())
}

#[test(tokio::test)]
async fn create_fans_out_to_three_replicas_and_resolves_on_quorum() {
    time::pause();
    let mut harness = setup(test_config());

    harness.membership_snapshot_tx.send(three_member_snapshot()).unwrap();
    time::advance(Duration::from_millis(20)).await; // let reconcile_ring build the ring

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    harness
        .command_tx
        .send(quorum_ring::kv::KvCommand::Create { key: "k".into(), value: "v".into(), reply: reply_tx })
        .await
        .unwrap();

    let mut trans_id = None;
    let mut seen = Vec::new();
    for _ in 0..3 {
        let (addr, message) = recv_decoded(&mut harness.transport_rx).await;
        assert!(matches!(message, KvMessage::Create { ref key, ref value, .. } if key == "k" && value == "v"));
        trans_id = Some(message.trans_id());
        seen.push(addr);
    }
    assert_eq!(seen.len(), 3, "create should fan out to all 3 replicas");
    let trans_id = trans_id.unwrap();

    // Two successful WRITE_REPLYs are enough to reach 2-of-3 quorum.
    for id in 1..=2u32 {
        let reply = KvMessage::WriteReply { trans_id, from: Address::new(id, 0), success: true };
        harness
            .inbound_tx
            .send(InboundMessage { peer_addr: socket_for(id), channel: Channel::Kv, payload: reply.encode().into_bytes() })
            .await
            .unwrap();
    }

    let outcome = time::timeout(Duration::from_secs(1), reply_rx).await.unwrap().unwrap();
    assert!(outcome, "create should resolve as successful once quorum is reached");

    harness.shutdown_token.cancel();
}

#[test(tokio::test)]
async fn create_fails_after_two_failure_replies() {
    time::pause();
    let mut harness = setup(test_config());

    harness.membership_snapshot_tx.send(three_member_snapshot()).unwrap();
    time::advance(Duration::from_millis(20)).await;

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    harness
        .command_tx
        .send(quorum_ring::kv::KvCommand::Create { key: "k".into(), value: "v".into(), reply: reply_tx })
        .await
        .unwrap();

    let mut trans_id = None;
    for _ in 0..3 {
        let (_, message) = recv_decoded(&mut harness.transport_rx).await;
        trans_id = Some(message.trans_id());
    }
    let trans_id = trans_id.unwrap();

    for id in 1..=2u32 {
        let reply = KvMessage::WriteReply { trans_id, from: Address::new(id, 0), success: false };
        harness
            .inbound_tx
            .send(InboundMessage { peer_addr: socket_for(id), channel: Channel::Kv, payload: reply.encode().into_bytes() })
            .await
            .unwrap();
    }

    let outcome = time::timeout(Duration::from_secs(1), reply_rx).await.unwrap().unwrap();
    assert!(!outcome, "create should resolve as failed once 2 of 3 replicas reject it");

    harness.shutdown_token.cancel();
}

#[test(tokio::test)]
async fn write_without_quorum_times_out_via_the_tick_sweep() {
    time::pause();
    let mut harness = setup(test_config());

    harness.membership_snapshot_tx.send(three_member_snapshot()).unwrap();
    time::advance(Duration::from_millis(20)).await;

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    harness
        .command_tx
        .send(quorum_ring::kv::KvCommand::Create { key: "k".into(), value: "v".into(), reply: reply_tx })
        .await
        .unwrap();

    for _ in 0..3 {
        recv_decoded(&mut harness.transport_rx).await;
    }

    // No replies at all arrive. t_txn_ticks=3 at 10ms/tick: the sweep fires
    // the transaction as a failure well before it would naturally resolve.
    time::advance(Duration::from_millis(10 * 5)).await;

    let outcome = time::timeout(Duration::from_secs(1), reply_rx).await.unwrap().unwrap();
    assert!(!outcome, "a transaction that never reaches quorum should time out as a failure");

    harness.shutdown_token.cancel();
}
