//! Slot migration driven through the admin protocol.

use crate::helpers::TestNode;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migration_moves_ownership_only_on_complete() {
    let a = TestNode::start("mig-a").await;
    let b = TestNode::start("mig-b").await;
    b.meet(&a).await;

    let mut client = a.client().await;
    client.ok("BALANCE").await;

    // foo hashes to 12182, owned by mig-b after balancing
    let before = client.ok("KEYSLOT foo").await;
    assert_eq!(before["slot"], 12182);
    assert_eq!(before["port"], b.coordinator.registry().local_node().unwrap().port);

    client.ok("MIGRATE START mig-b mig-a 12180-12185").await;
    let err = client.err("MIGRATE START mig-b mig-a 12190").await;
    assert_eq!(err, "a migration is already in progress");

    client.ok("MIGRATE PROGRESS 40 65536").await;
    let owner = client.ok("KEYSLOT foo").await;
    assert_eq!(owner["port"], before["port"]);

    let status = client.ok("MIGRATE STATUS").await;
    assert_eq!(status["state"], "migrating");
    assert_eq!(status["slot_count"], 6);
    assert_eq!(status["progress"], 40.0);

    let done = client.ok("MIGRATE COMPLETE").await;
    assert_eq!(done["state"], "completed");
    assert_eq!(done["progress"], 100.0);

    let owner = client.ok("KEYSLOT foo").await;
    assert_eq!(owner["port"], a.coordinator.registry().local_node().unwrap().port);

    let dist = client.ok("DISTRIBUTION").await;
    assert_eq!(dist["mig-a"], 8198);
    assert_eq!(dist["mig-b"], 8186);

    let err = client.err("MIGRATE COMPLETE").await;
    assert_eq!(err, "no migration in progress (state is completed)");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn cancelled_migration_leaves_slots_in_place() {
    let a = TestNode::start("cancel-a").await;
    let mut client = a.client().await;
    client.ok("ASSIGN cancel-a 0-16383").await;

    let err = client.err("MIGRATE START cancel-a ghost 1").await;
    assert_eq!(err, "node ghost not found in cluster");

    let err = client.err("MIGRATE START cancel-a cancel-a 1").await;
    assert_eq!(err, "source and target are the same node");

    client.ok("MIGRATE CANCEL").await;
    let status = client.ok("MIGRATE STATUS").await;
    assert_eq!(status["state"], "cancelled");
    assert_eq!(status["bytes_transferred"], 0);

    let health = client.ok("HEALTH").await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["covered_slots"], 16384);
    a.stop().await;
}
