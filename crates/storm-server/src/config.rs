//! Node configuration.
//!
//! Values resolve in order: built-in defaults, then the TOML file given
//! with `--config`, then `STORM_*` environment variables, then CLI flags.
//! Only the last two are handled by clap; this module owns the first two.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use storm_cluster::{FailoverConfig, GossipConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StormConfig {
    /// Address the admin and gossip listeners bind to.
    pub bind: String,
    /// Client-facing data port advertised in redirects.
    pub port: u16,
    /// Stable node ID. Empty means a random one per start.
    pub node_id: String,
    /// Admin command port. 0 picks a free port.
    pub admin_port: u16,
    /// Prometheus endpoint port. 0 disables it.
    pub metrics_port: u16,
    pub cluster: ClusterSection,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 6379,
            node_id: String::new(),
            admin_port: 7379,
            metrics_port: 0,
            cluster: ClusterSection::default(),
        }
    }
}

/// The `[cluster]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Gossip listener port. 0 picks a free port.
    pub gossip_port: u16,
    /// Address other nodes use to reach this one. Defaults to `bind`.
    pub advertise_addr: String,
    /// Gossip endpoints (`host:port`) met at startup.
    pub seeds: Vec<String>,
    /// Assign every slot to this node at startup.
    pub bootstrap: bool,
    pub gossip_interval_ms: u64,
    pub io_timeout_ms: u64,
    pub failure_multiplier: u32,
    /// 0 keeps silent peers forever.
    pub peer_ttl_secs: u64,
    pub election_delay_ms: u64,
    /// 0 waits for votes forever.
    pub vote_timeout_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            gossip_port: 16379,
            advertise_addr: String::new(),
            seeds: Vec::new(),
            bootstrap: false,
            gossip_interval_ms: 1_000,
            io_timeout_ms: 2_000,
            failure_multiplier: 5,
            peer_ttl_secs: 300,
            election_delay_ms: 2_000,
            vote_timeout_ms: 30_000,
        }
    }
}

impl StormConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects values that would stall or break the cluster loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.parse::<IpAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "bind '{}' is not an IP address",
                self.bind
            )));
        }
        let c = &self.cluster;
        if c.gossip_interval_ms == 0 {
            return Err(ConfigError::Invalid("gossip_interval_ms must be positive".into()));
        }
        if c.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("io_timeout_ms must be positive".into()));
        }
        if c.failure_multiplier == 0 {
            return Err(ConfigError::Invalid("failure_multiplier must be positive".into()));
        }
        for seed in &c.seeds {
            parse_seed(seed)?;
        }
        Ok(())
    }

    /// The host advertised to peers and clients.
    pub fn advertise_host(&self) -> &str {
        if self.cluster.advertise_addr.is_empty() {
            &self.bind
        } else {
            &self.cluster.advertise_addr
        }
    }

    pub fn gossip_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.bind, self.cluster.gossip_port)
    }

    pub fn admin_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        socket_addr(&self.bind, self.admin_port)
    }

    pub fn metrics_bind_addr(&self) -> Option<SocketAddr> {
        if self.metrics_port == 0 {
            return None;
        }
        socket_addr(&self.bind, self.metrics_port).ok()
    }

    pub fn gossip_config(&self) -> GossipConfig {
        let c = &self.cluster;
        GossipConfig {
            interval: Duration::from_millis(c.gossip_interval_ms),
            io_timeout: Duration::from_millis(c.io_timeout_ms),
            failure_multiplier: c.failure_multiplier,
            peer_ttl: (c.peer_ttl_secs > 0).then(|| Duration::from_secs(c.peer_ttl_secs)),
        }
    }

    pub fn failover_config(&self) -> FailoverConfig {
        let c = &self.cluster;
        FailoverConfig {
            election_delay: Duration::from_millis(c.election_delay_ms),
            vote_timeout: (c.vote_timeout_ms > 0).then(|| Duration::from_millis(c.vote_timeout_ms)),
        }
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("bad address '{host}:{port}': {e}")))
}

/// Splits a `host:port` seed. The host may be a name.
pub fn parse_seed(seed: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("seed '{seed}' is not host:port"));
    let (host, port) = seed.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}
