//! Failover from detection to promotion.

use std::sync::Arc;
use std::time::Duration;

use storm_cluster::{
    ClusterNode, ClusterRegistry, FailoverConfig, FailoverManager, FailoverState, HealthStatus,
    NodeId, NodeRole, NodeState, SlotRouter, VoteOutcome, SLOT_COUNT,
};

use crate::helpers::{wait_until, TestNode};

fn primary(id: &str, port: u16) -> ClusterNode {
    ClusterNode::new_primary(NodeId::from(id), "127.0.0.1", port, port + 10_000)
        .with_state(NodeState::Online)
}

/// Three balanced primaries, one replica, the replica's primary fails.
#[test]
fn three_node_cluster_survives_primary_loss() {
    let registry = Arc::new(ClusterRegistry::new(primary("node-1", 7001)));
    registry.add_node(primary("node-2", 7002)).unwrap();
    registry.add_node(primary("node-3", 7003)).unwrap();
    registry.balance_slots();

    let dist = registry.slot_distribution();
    assert_eq!(dist[&NodeId::from("node-1")], 5462);
    assert_eq!(dist[&NodeId::from("node-2")], 5461);
    assert_eq!(dist[&NodeId::from("node-3")], 5461);
    assert_eq!(registry.health().status, HealthStatus::Ok);

    let mut replica = ClusterNode::new_replica(
        NodeId::from("r"),
        "127.0.0.1",
        7004,
        17004,
        NodeId::from("node-2"),
    )
    .with_state(NodeState::Online);
    replica.replication_offset = 1_000;
    registry.add_node(replica).unwrap();

    let router = SlotRouter::new(Arc::clone(&registry));
    let owned_by_2: Vec<u16> = (0..SLOT_COUNT)
        .filter(|&s| router.owner_of(s).is_some_and(|n| n.id.as_str() == "node-2"))
        .collect();
    assert_eq!(owned_by_2.len(), 5461);

    registry
        .set_state(&NodeId::from("node-2"), NodeState::Failed)
        .unwrap();
    assert_eq!(registry.health().status, HealthStatus::Degraded);

    let fm = FailoverManager::new(Arc::clone(&registry), FailoverConfig::default());
    let generation = fm.start_failover(&NodeId::from("node-2")).unwrap();
    assert_eq!(fm.run_election(generation), FailoverState::InProgress);

    let r = NodeId::from("r");
    // quorum of three primaries is two
    assert!(matches!(
        fm.vote(NodeId::from("node-1"), &r).unwrap(),
        VoteOutcome::Pending { votes: 1, quorum: 2 }
    ));
    assert!(matches!(
        fm.vote(NodeId::from("node-3"), &r).unwrap(),
        VoteOutcome::Promoted { .. }
    ));
    assert!(fm.vote(NodeId::from("node-2"), &r).is_err());

    for slot in owned_by_2 {
        assert_eq!(router.owner_of(slot).unwrap().id, r);
    }
    let promoted = registry.node(&r).unwrap();
    assert_eq!(promoted.role, NodeRole::Primary);
    assert_eq!(promoted.slot_count(), 5461);

    let health = registry.health();
    assert_eq!(health.status, HealthStatus::Ok);
    assert_eq!(health.covered_slots, SLOT_COUNT as usize);
    assert_eq!(health.online_primaries, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detected_failure_elects_replica_over_gossip() {
    let a = TestNode::start("fo-a").await;
    let b = TestNode::start("fo-b").await;
    let c = TestNode::start("fo-c").await;
    let r = TestNode::start_replica("fo-r", "fo-c").await;
    for n in [&b, &c, &r] {
        n.meet(&a).await;
    }

    wait_until(Duration::from_secs(5), "a to see everyone online", || {
        let nodes = a.coordinator.registry().nodes();
        nodes.len() == 4 && nodes.iter().all(|n| n.state == NodeState::Online)
    })
    .await;

    let mut client = a.client().await;
    let report = client.ok("REBALANCE").await;
    assert_eq!(report["primaries"], 3);
    client.ok("OFFSET fo-r 4096").await;
    let c_slots = client.ok("NODE fo-c").await["slot_count"].as_u64().unwrap();
    assert!(c_slots > 0);
    let replica = client.ok("NODE fo-r").await;
    assert_eq!(replica["role"], "slave");
    assert_eq!(replica["replica_of"], "fo-c");

    c.stop().await;

    wait_until(Duration::from_secs(10), "an election for fo-r", || {
        let status = a.coordinator.failover().status();
        status.state == FailoverState::InProgress
            && status.candidate.as_ref().map(NodeId::as_str) == Some("fo-r")
    })
    .await;

    let status = client.ok("FAILOVER STATUS").await;
    assert_eq!(status["failed_node"], "fo-c");
    assert_eq!(status["quorum"], 2);

    let err = client.err("VOTE fo-a fo-b").await;
    assert!(err.contains("does not match"), "{err}");
    let first = client.ok("VOTE fo-a fo-r").await;
    assert_eq!(first["outcome"], "pending");
    let second = client.ok("VOTE fo-b fo-r").await;
    assert_eq!(second["outcome"], "promoted");
    assert_eq!(second["slots"], c_slots);

    let dist = client.ok("DISTRIBUTION").await;
    assert_eq!(dist["fo-r"], c_slots);
    assert_eq!(dist["fo-c"], 0);
    let promoted = client.ok("NODE fo-r").await;
    assert_eq!(promoted["role"], "master");
    let demoted = client.ok("NODE fo-c").await;
    assert_eq!(demoted["role"], "slave");
    assert_eq!(demoted["replica_of"], "fo-r");

    let slots = client.ok("SLOTS").await;
    assert_eq!(slots["covered"], SLOT_COUNT);

    for n in [&a, &b, &r] {
        n.stop().await;
    }
}
