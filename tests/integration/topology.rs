//! tests/integration/topology.rs
//!
//! E2E tests for ring resilience: a replica failing and the stabilization
//! protocol restoring the 3-replica invariant (S2, §4.5).

use crate::common::harness::{self, TestNode};
use quorum_ring::{domain::Address, kv::ring::Ring};
use std::time::Duration;
use test_log::test;

const RING_SIZE: u64 = 512;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_stabilization_restores_replication_after_replica_failure() {
    let test_timeout = Duration::from_secs(30);
    let result = tokio::time::timeout(test_timeout, async {
        let trusted_certs = harness::generate_certs("localhost");

        // A 4-node cluster, all bootstrapping through the introducer.
        let node_1 = TestNode::spawn(Address::INTRODUCER, Address::INTRODUCER, vec![], &trusted_certs)
            .await
            .unwrap();
        let node_2 = TestNode::spawn(Address::new(2, 0), Address::INTRODUCER, vec![node_1.bind_addr], &trusted_certs)
            .await
            .unwrap();
        let node_3 = TestNode::spawn(Address::new(3, 0), Address::INTRODUCER, vec![node_1.bind_addr], &trusted_certs)
            .await
            .unwrap();
        let node_4 = TestNode::spawn(Address::new(4, 0), Address::INTRODUCER, vec![node_1.bind_addr], &trusted_certs)
            .await
            .unwrap();

        let mut nodes = vec![node_1, node_2, node_3, node_4];

        let mut ws_client_1 = nodes[0].ws_client().await.unwrap();
        harness::wait_for_snapshot(&mut ws_client_1, |s| s.members.len() == 4, Duration::from_secs(10))
            .await
            .expect("All 4 nodes should converge on membership");

        // Work out which 3 of the 4 addresses hold "key" before anything fails.
        let addresses: Vec<Address> = nodes.iter().map(|n| n.config.identity).collect();
        let ring = Ring::build(&addresses, RING_SIZE);
        let replicas = ring.find_replicas("key", RING_SIZE);
        assert_eq!(replicas.len(), 3);

        let created = nodes[0].kv.create("key", "value").await;
        assert!(created, "CREATE should reach quorum across the initial 3 replicas");

        // Kill the tertiary replica.
        let tertiary = replicas[2];
        let dead_idx = nodes.iter().position(|n| n.config.identity == tertiary).unwrap();
        nodes[dead_idx].shutdown();
        let survivor_idx = (0..nodes.len()).find(|&i| i != dead_idx).unwrap();

        // Wait for a survivor's membership to prune the dead node.
        let mut ws_survivor = nodes[survivor_idx].ws_client().await.unwrap();
        harness::wait_for_snapshot(&mut ws_survivor, |s| s.members.len() == 3, Duration::from_secs(15))
            .await
            .expect("Survivors should detect and evict the failed replica");

        // Give the stabilization protocol a few ticks to re-replicate.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let value = nodes[survivor_idx].kv.read("key").await;
        assert_eq!(value.as_deref(), Some("value"), "Key should still be readable with quorum among the 3 survivors");

        for (i, node) in nodes.iter().enumerate() {
            if i != dead_idx {
                node.shutdown();
            }
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out");
}
