//! Test helpers: in-process cluster nodes, spawned storm-server processes,
//! and a client for the admin protocol.

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use storm_cluster::{NodeId, NodeRole};
use storm_server::{AdminServer, ClusterCoordinator, StormConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Timing used by every test node: failures are detected after 500ms.
pub fn fast_config(node_id: &str) -> StormConfig {
    let mut cfg = StormConfig {
        node_id: node_id.into(),
        // only advertised, never bound; unique so redirects tell nodes apart
        port: find_free_port(),
        admin_port: 0,
        ..StormConfig::default()
    };
    cfg.cluster.gossip_port = 0;
    cfg.cluster.gossip_interval_ms = 100;
    cfg.cluster.io_timeout_ms = 500;
    cfg.cluster.failure_multiplier = 5;
    cfg.cluster.election_delay_ms = 200;
    cfg.cluster.vote_timeout_ms = 0;
    cfg
}

/// A coordinator plus admin listener running inside the test process.
pub struct TestNode {
    pub coordinator: Arc<ClusterCoordinator>,
    pub admin: Arc<AdminServer>,
    pub gossip_addr: SocketAddr,
    pub admin_addr: SocketAddr,
}

impl TestNode {
    pub async fn start(node_id: &str) -> Self {
        Self::start_with(fast_config(node_id), |_| {}).await
    }

    /// Starts a node after letting `prepare` adjust the registry, e.g. to
    /// turn the local node into a replica before anyone discovers it.
    pub async fn start_with(
        cfg: StormConfig,
        prepare: impl FnOnce(&ClusterCoordinator),
    ) -> Self {
        let coordinator = Arc::new(ClusterCoordinator::from_config(&cfg).unwrap());
        prepare(&coordinator);
        let gossip_addr = coordinator.start().await.unwrap();
        let admin = Arc::new(AdminServer::new(Arc::clone(&coordinator)));
        let admin_addr = admin
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Self {
            coordinator,
            admin,
            gossip_addr,
            admin_addr,
        }
    }

    /// Starts a replica of `primary`.
    pub async fn start_replica(node_id: &str, primary: &str) -> Self {
        let primary = NodeId::from(primary);
        Self::start_with(fast_config(node_id), move |c| {
            let mut state = c.registry().write();
            let local = state.local_id().clone();
            if let Some(node) = state.node_mut(&local) {
                node.role = NodeRole::Replica;
                node.replica_of = Some(primary);
            }
        })
        .await
    }

    pub fn id(&self) -> &NodeId {
        self.coordinator.local_id()
    }

    pub async fn client(&self) -> AdminClient {
        AdminClient::connect(self.admin_addr).await
    }

    /// Introduces this node to `other` over gossip.
    pub async fn meet(&self, other: &TestNode) {
        self.coordinator
            .meet("127.0.0.1", other.gossip_addr.port())
            .await
            .unwrap();
    }

    pub async fn stop(&self) {
        self.admin.shutdown().await;
        self.coordinator.shutdown().await;
    }
}

/// A storm-server subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub admin_port: u16,
    pub gossip_port: u16,
}

/// Options for starting a test server.
#[derive(Default)]
pub struct ServerOptions {
    pub node_id: Option<String>,
    pub bootstrap: bool,
    pub seeds: Vec<String>,
    pub data_port: Option<u16>,
}

impl TestServer {
    /// Starts a new storm-server on random ports.
    ///
    /// Blocks until the admin port accepts connections (up to 5 seconds).
    pub fn start_with(opts: ServerOptions) -> Self {
        let admin_port = find_free_port();
        let gossip_port = find_free_port();

        let binary = server_binary();
        let mut cmd = Command::new(&binary);
        cmd.arg("--bind").arg("127.0.0.1");
        cmd.arg("--admin-port").arg(admin_port.to_string());
        cmd.arg("--gossip-port").arg(gossip_port.to_string());
        cmd.arg("--gossip-interval-ms").arg("100");
        if let Some(ref id) = opts.node_id {
            cmd.arg("--node-id").arg(id);
        }
        if let Some(port) = opts.data_port {
            cmd.arg("--port").arg(port.to_string());
        }
        if opts.bootstrap {
            cmd.arg("--bootstrap");
        }
        for seed in &opts.seeds {
            cmd.arg("--seed").arg(seed);
        }
        // suppress tracing output in tests
        cmd.env("RUST_LOG", "error");

        let child = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to spawn storm-server at {}: {e}", binary.display()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if std::time::Instant::now() > deadline {
                panic!("storm-server failed to start within 5 seconds on port {admin_port}");
            }
            if std::net::TcpStream::connect(("127.0.0.1", admin_port)).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        Self {
            child,
            admin_port,
            gossip_port,
        }
    }

    pub async fn client(&self) -> AdminClient {
        AdminClient::connect(SocketAddr::from(([127, 0, 0, 1], self.admin_port))).await
    }

    pub fn gossip_endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.gossip_port)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A minimal client for the line-based admin protocol.
pub struct AdminClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl AdminClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to {addr}: {e}"));
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Sends one command and returns the whole reply object.
    pub async fn cmd(&mut self, line: &str) -> Value {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        let reply = self
            .lines
            .next_line()
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("server closed connection while waiting for '{line}'"));
        serde_json::from_str(&reply).unwrap()
    }

    /// Sends a command that must succeed and returns its result.
    pub async fn ok(&mut self, line: &str) -> Value {
        let reply = self.cmd(line).await;
        assert_eq!(reply["ok"], true, "'{line}' failed: {reply}");
        reply["result"].clone()
    }

    /// Sends a command that must fail and returns the error message.
    pub async fn err(&mut self, line: &str) -> String {
        let reply = self.cmd(line).await;
        assert_eq!(reply["ok"], false, "'{line}' unexpectedly succeeded: {reply}");
        reply["error"].as_str().unwrap_or_default().to_string()
    }
}

/// Polls `check` every 50ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out after {limit:?} waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Finds a free TCP port by binding to port 0.
fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Locates the storm-server binary in the cargo target directory.
pub fn server_binary() -> PathBuf {
    // test binary is in target/<profile>/deps/, the server one level up
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(format!("storm-server{}", std::env::consts::EXE_SUFFIX));
    if !path.exists() {
        panic!(
            "storm-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
