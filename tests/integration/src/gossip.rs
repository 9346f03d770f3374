//! Membership convergence and failure detection across in-process nodes.

use std::time::Duration;

use storm_cluster::{NodeId, NodeState};

use crate::helpers::{wait_until, TestNode};

fn state_of(node: &TestNode, id: &NodeId) -> Option<NodeState> {
    node.coordinator.registry().node(id).map(|n| n.state)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_nodes_converge_through_one_seed() {
    let a = TestNode::start("gossip-a").await;
    let b = TestNode::start("gossip-b").await;
    let c = TestNode::start("gossip-c").await;

    b.meet(&a).await;
    c.meet(&a).await;

    // b and c never met directly; they learn about each other through a
    wait_until(Duration::from_secs(5), "full membership", || {
        [&a, &b, &c]
            .iter()
            .all(|n| n.coordinator.registry().node_count() == 3)
    })
    .await;

    for observer in [&a, &b, &c] {
        for target in [&a, &b, &c] {
            assert_eq!(state_of(observer, target.id()), Some(NodeState::Online));
        }
    }

    let mut client = b.client().await;
    let nodes = client.ok("NODES").await;
    let ids: Vec<&str> = nodes
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gossip-a", "gossip-b", "gossip-c"]);
    let myself: Vec<bool> = nodes
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["myself"].as_bool().unwrap())
        .collect();
    assert_eq!(myself, vec![false, true, false]);

    for n in [&a, &b, &c] {
        n.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_node_is_marked_failed_and_recovers_on_contact() {
    let a = TestNode::start("detect-a").await;
    let b = TestNode::start("detect-b").await;
    b.meet(&a).await;

    wait_until(Duration::from_secs(5), "a to see b", || {
        state_of(&a, b.id()) == Some(NodeState::Online)
    })
    .await;

    b.stop().await;
    wait_until(Duration::from_secs(5), "a to mark b failed", || {
        state_of(&a, b.id()) == Some(NodeState::Failed)
    })
    .await;

    let mut client = a.client().await;
    let health = client.ok("HEALTH").await;
    assert_eq!(health["failed_nodes"], 1);
    assert_ne!(health["status"], "ok");

    // a fresh process with the same identity is heard from directly again
    let b2 = TestNode::start("detect-b").await;
    b2.meet(&a).await;
    wait_until(Duration::from_secs(5), "a to revive b", || {
        state_of(&a, b2.id()) == Some(NodeState::Online)
    })
    .await;

    a.stop().await;
    b2.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn meet_over_admin_and_forget() {
    let a = TestNode::start("admin-a").await;
    let b = TestNode::start("admin-b").await;

    let mut client = a.client().await;
    let reply = client
        .ok(&format!("MEET 127.0.0.1 {}", b.gossip_addr.port()))
        .await;
    assert_eq!(reply["nodes"], 2);

    let err = client.err("MEET 127.0.0.1 1").await;
    assert!(!err.is_empty());

    // stop b first so its pings cannot re-introduce it
    b.stop().await;
    client.ok("FORGET admin-b").await;
    assert_eq!(a.coordinator.registry().node_count(), 1);
    a.stop().await;
}
