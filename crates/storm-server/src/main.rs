use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use storm_server::{metrics, AdminServer, ClusterCoordinator, StormConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "storm-server", about = "storm cluster node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "STORM_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind the admin and gossip listeners to
    #[arg(long, env = "STORM_BIND")]
    bind: Option<String>,

    /// client-facing data port advertised in redirects
    #[arg(short, long, env = "STORM_PORT")]
    port: Option<u16>,

    /// stable node ID. random when unset
    #[arg(long, env = "STORM_NODE_ID")]
    node_id: Option<String>,

    /// port for the admin command listener (0 = any free port)
    #[arg(long, env = "STORM_ADMIN_PORT")]
    admin_port: Option<u16>,

    /// port for prometheus metrics HTTP endpoint (0 = disabled)
    #[arg(long, env = "STORM_METRICS_PORT")]
    metrics_port: Option<u16>,

    // -- cluster options --
    /// port for the gossip listener (0 = any free port)
    #[arg(long, env = "STORM_GOSSIP_PORT")]
    gossip_port: Option<u16>,

    /// address other nodes should use to reach this one
    #[arg(long, env = "STORM_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,

    /// gossip endpoint (host:port) to meet at startup. repeatable
    #[arg(long = "seed", env = "STORM_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// start a new cluster with this node owning all 16384 slots
    #[arg(long, env = "STORM_BOOTSTRAP")]
    bootstrap: bool,

    /// milliseconds between gossip rounds
    #[arg(long, env = "STORM_GOSSIP_INTERVAL_MS")]
    gossip_interval_ms: Option<u64>,

    /// a node silent for interval * multiplier is marked failed
    #[arg(long, env = "STORM_FAILURE_MULTIPLIER")]
    failure_multiplier: Option<u32>,

    /// milliseconds to wait before picking a failover candidate
    #[arg(long, env = "STORM_ELECTION_DELAY_MS")]
    election_delay_ms: Option<u64>,

    /// milliseconds an election may wait for quorum (0 = forever)
    #[arg(long, env = "STORM_VOTE_TIMEOUT_MS")]
    vote_timeout_ms: Option<u64>,
}

/// Applies CLI overrides to a `StormConfig`. Only `Some` values from the
/// CLI args take effect, preserving the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut StormConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(ref id) = args.node_id {
        cfg.node_id = id.clone();
    }
    if let Some(port) = args.admin_port {
        cfg.admin_port = port;
    }
    if let Some(port) = args.metrics_port {
        cfg.metrics_port = port;
    }
    if let Some(port) = args.gossip_port {
        cfg.cluster.gossip_port = port;
    }
    if let Some(ref addr) = args.advertise_addr {
        cfg.cluster.advertise_addr = addr.clone();
    }
    if !args.seeds.is_empty() {
        cfg.cluster.seeds = args.seeds.clone();
    }
    if args.bootstrap {
        cfg.cluster.bootstrap = true;
    }
    if let Some(v) = args.gossip_interval_ms {
        cfg.cluster.gossip_interval_ms = v;
    }
    if let Some(v) = args.failure_multiplier {
        cfg.cluster.failure_multiplier = v;
    }
    if let Some(v) = args.election_delay_ms {
        cfg.cluster.election_delay_ms = v;
    }
    if let Some(v) = args.vote_timeout_ms {
        cfg.cluster.vote_timeout_ms = v;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storm=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match StormConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => StormConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => StormConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let admin_addr = cfg.admin_bind_addr().unwrap_or_else(|e| exit_err(e));
    let coordinator = Arc::new(ClusterCoordinator::from_config(&cfg).unwrap_or_else(|e| exit_err(e)));

    if let Some(addr) = cfg.metrics_bind_addr() {
        let handle = metrics::install_recorder().unwrap_or_else(|e| exit_err(e));
        metrics::spawn_http_server(addr, handle, Arc::clone(&coordinator));
        metrics::spawn_stats_poller(Arc::clone(&coordinator), Duration::from_secs(5));
    }

    let gossip_addr = coordinator
        .start()
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to start gossip: {e}")));

    let admin = Arc::new(AdminServer::new(Arc::clone(&coordinator)));
    let admin_addr = admin
        .start(admin_addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind admin listener on {admin_addr}: {e}")));

    info!(
        node_id = %coordinator.local_id(),
        gossip = %gossip_addr,
        admin = %admin_addr,
        "storm-server ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        exit_err(format!("failed to listen for shutdown signal: {e}"));
    }
    info!("shutting down");
    admin.shutdown().await;
    coordinator.shutdown().await;
}
