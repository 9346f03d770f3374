//! Tests against spawned storm-server processes.

use std::process::Command;
use std::time::Duration;

use crate::helpers::{server_binary, ServerOptions, TestServer};

#[test]
fn config_template_prints_defaults() {
    let output = Command::new(server_binary())
        .arg("--config-template")
        .env("RUST_LOG", "error")
        .output()
        .unwrap();
    assert!(output.status.success(), "exit code: {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[cluster]"), "got: {stdout}");
    assert!(stdout.contains("gossip_interval_ms = 1000"), "got: {stdout}");
}

#[test]
fn invalid_settings_exit_with_error() {
    let output = Command::new(server_binary())
        .args(["--gossip-interval-ms", "0", "--admin-port", "0"])
        .env("RUST_LOG", "error")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("gossip_interval_ms"), "got: {stderr}");
}

#[tokio::test]
async fn bootstrapped_server_is_healthy() {
    let server = TestServer::start_with(ServerOptions {
        node_id: Some("proc-1".into()),
        bootstrap: true,
        data_port: Some(7100),
        ..Default::default()
    });
    let mut c = server.client().await;

    assert_eq!(c.ok("PING").await, "PONG");
    assert_eq!(c.ok("MYID").await, "proc-1");

    let health = c.ok("HEALTH").await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["covered_slots"], 16384);

    let slot = c.ok("KEYSLOT {user}:1").await;
    assert_eq!(slot["port"], 7100);
    assert_eq!(slot["slot"], c.ok("KEYSLOT {user}:2").await["slot"]);

    let started = c.ok("FAILOVER proc-1").await;
    assert_eq!(started["generation"], 1);
    let err = c.err("FAILOVER proc-1").await;
    assert_eq!(err, "a failover is already waiting");
}

#[tokio::test]
async fn second_process_joins_through_seed() {
    let first = TestServer::start_with(ServerOptions {
        node_id: Some("seed-1".into()),
        bootstrap: true,
        ..Default::default()
    });
    let second = TestServer::start_with(ServerOptions {
        node_id: Some("seed-2".into()),
        seeds: vec![first.gossip_endpoint()],
        ..Default::default()
    });

    let mut c1 = first.client().await;
    let mut c2 = second.client().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let n1 = c1.ok("NODES").await.as_array().map_or(0, Vec::len);
        let n2 = c2.ok("NODES").await.as_array().map_or(0, Vec::len);
        if n1 == 2 && n2 == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "membership did not converge: {n1} and {n2} nodes"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let peer = c2.ok("NODE seed-1").await;
    assert_eq!(peer["state"], "online");
    assert_eq!(peer["gossip_port"], first.gossip_port);
}
