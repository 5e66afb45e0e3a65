//! tests/integration/adversarial.rs
//!
//! E2E tests for the edge cases and failure modes of the quorum coordinator:
//! reads/writes issued while a replica is down (S4, S5), deleting a key that
//! never existed (S6), and idempotent re-delete (L2).

use crate::common::harness::{self, TestNode};
use quorum_ring::{domain::Address, kv::ring::Ring};
use std::time::Duration;
use test_log::test;

const RING_SIZE: u64 = 512;

async fn spawn_ring(certs: &harness::CertSet, n: u32) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    let introducer = Address::INTRODUCER;
    let node_1 = TestNode::spawn(introducer, introducer, vec![], certs).await.unwrap();
    let bootstrap = node_1.bind_addr;
    nodes.push(node_1);
    for id in 2..=n {
        let node = TestNode::spawn(Address::new(id, 0), introducer, vec![bootstrap], certs).await.unwrap();
        nodes.push(node);
    }

    let mut ws = nodes[0].ws_client().await.unwrap();
    harness::wait_for_snapshot(&mut ws, |s| s.members.len() == n as usize, Duration::from_secs(10))
        .await
        .expect("All nodes should converge on membership");
    nodes
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_delete_of_nonexistent_key_fails_quorate() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let certs = harness::generate_certs("localhost");
        let nodes = spawn_ring(&certs, 3).await;

        let deleted = nodes[0].kv.delete("never-created").await;
        assert!(!deleted, "DELETE of a key with no stored value should fail, not succeed");

        for node in &nodes {
            node.shutdown();
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_delete_is_idempotent() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let certs = harness::generate_certs("localhost");
        let nodes = spawn_ring(&certs, 3).await;

        assert!(nodes[0].kv.create("k", "v").await);
        assert!(nodes[0].kv.delete("k").await, "First delete should succeed");
        assert!(!nodes[0].kv.delete("k").await, "Second delete of an already-deleted key should fail (L2)");
        assert_eq!(nodes[0].kv.read("k").await, None, "Key should no longer be readable");

        for node in &nodes {
            node.shutdown();
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_read_survives_a_single_replica_failure() {
    let test_timeout = Duration::from_secs(30);
    let result = tokio::time::timeout(test_timeout, async {
        let certs = harness::generate_certs("localhost");
        let mut nodes = spawn_ring(&certs, 3).await;

        assert!(nodes[0].kv.create("k", "v").await);

        let addresses: Vec<Address> = nodes.iter().map(|n| n.config.identity).collect();
        let ring = Ring::build(&addresses, RING_SIZE);
        let replicas = ring.find_replicas("k", RING_SIZE);
        let tertiary = replicas[2];
        let dead_idx = nodes.iter().position(|n| n.config.identity == tertiary).unwrap();

        nodes[dead_idx].shutdown();
        let coordinator_idx = (0..nodes.len()).find(|&i| i != dead_idx).unwrap();

        // With only 2 of 3 replicas reachable, READ must still reach a 2-of-3
        // quorum before the per-transaction timeout sweeps it away as a failure.
        let value = nodes[coordinator_idx].kv.read("k").await;
        assert_eq!(value.as_deref(), Some("v"), "Quorum should still be reachable with one replica down");

        for (i, node) in nodes.drain(..).enumerate() {
            if i != dead_idx {
                node.shutdown();
            }
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}
