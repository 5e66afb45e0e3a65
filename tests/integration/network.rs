//! tests/integration/network.rs
//!
//! Full end-to-end integration test for the membership/KV ring. This test
//! spins up real nodes over QUIC and verifies that membership state
//! propagates via gossip, and that a replicated value written through one
//! node becomes readable through another (S1: join convergence).

use crate::common::harness::{self, TestNode};
use quorum_ring::domain::Address;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_membership_converges_across_two_nodes() {
    let test_timeout = Duration::from_secs(10);
    let result = tokio::time::timeout(test_timeout, async {
        let trusted_certs = harness::generate_certs("localhost");

        let node_a = TestNode::spawn(Address::INTRODUCER, Address::INTRODUCER, vec![], &trusted_certs)
            .await
            .expect("Failed to spawn node A");

        let node_b = TestNode::spawn(Address::new(2, 0), Address::INTRODUCER, vec![node_a.bind_addr], &trusted_certs)
            .await
            .expect("Failed to spawn node B");

        let mut ws_client_b = node_b.ws_client().await.expect("Failed to connect ws client to B");

        let final_state = harness::wait_for_snapshot(
            &mut ws_client_b,
            |snapshot| snapshot.members.len() == 2,
            Duration::from_secs(5),
        )
        .await
        .expect("Failed to observe membership convergence");

        assert_eq!(final_state.members.len(), 2, "Node B should know about 2 members");

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_write_through_a_is_readable_through_b() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let trusted_certs = harness::generate_certs("localhost");

        let node_a = TestNode::spawn(Address::INTRODUCER, Address::INTRODUCER, vec![], &trusted_certs)
            .await
            .expect("Failed to spawn node A");
        let node_b = TestNode::spawn(Address::new(2, 0), Address::INTRODUCER, vec![node_a.bind_addr], &trusted_certs)
            .await
            .expect("Failed to spawn node B");
        let node_c = TestNode::spawn(Address::new(3, 0), Address::INTRODUCER, vec![node_a.bind_addr], &trusted_certs)
            .await
            .expect("Failed to spawn node C");

        let mut ws_client_c = node_c.ws_client().await.expect("Failed to connect ws client to C");
        harness::wait_for_snapshot(&mut ws_client_c, |snapshot| snapshot.members.len() == 3, Duration::from_secs(8))
            .await
            .expect("Ring should reach 3 members before issuing a write");

        let created = node_a.kv.create("hello", "world").await;
        assert!(created, "CREATE should reach quorum across the 3-node ring");

        let value = node_b.kv.read("hello").await;
        assert_eq!(value.as_deref(), Some("world"), "READ through a different node should see the replicated value");

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    })
    .await;

    assert!(result.is_ok(), "Test timed out");
}
