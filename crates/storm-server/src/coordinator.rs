//! Wires the cluster components into one running node.
//!
//! The coordinator owns the shared registry and hands `Arc`s of it to the
//! router, the gossip service, the failover manager and the migrator. It
//! also consumes gossip events: a primary detected as failed by this node
//! triggers a failover session.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use storm_cluster::{
    ClusterError, ClusterNode, ClusterRegistry, FailoverConfig, FailoverManager, GossipConfig,
    GossipEvent, GossipService, NodeId, NodeRole, NodeState, SlotMigrator, SlotRange, SlotRouter,
    SLOT_COUNT,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{parse_seed, ConfigError, StormConfig};

const EVENT_BUFFER: usize = 256;

pub struct ClusterCoordinator {
    registry: Arc<ClusterRegistry>,
    router: SlotRouter,
    gossip: Arc<GossipService>,
    failover: Arc<FailoverManager>,
    migrator: SlotMigrator,
    seeds: Vec<(String, u16)>,
    events: Mutex<Option<mpsc::Receiver<GossipEvent>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("local_id", self.registry.local_id())
            .finish_non_exhaustive()
    }
}

impl ClusterCoordinator {
    /// Builds a stopped coordinator around `local`.
    pub fn new(
        local: ClusterNode,
        gossip_addr: SocketAddr,
        gossip_config: GossipConfig,
        failover_config: FailoverConfig,
    ) -> Self {
        let registry = Arc::new(ClusterRegistry::new(local));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let gossip = Arc::new(GossipService::new(
            Arc::clone(&registry),
            gossip_addr,
            gossip_config,
            event_tx,
        ));

        Self {
            router: SlotRouter::new(Arc::clone(&registry)),
            failover: Arc::new(FailoverManager::new(Arc::clone(&registry), failover_config)),
            migrator: SlotMigrator::new(Arc::clone(&registry)),
            gossip,
            registry,
            seeds: Vec::new(),
            events: Mutex::new(Some(event_rx)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Builds a coordinator from resolved configuration.
    ///
    /// With `bootstrap` set the local node starts out owning every slot.
    pub fn from_config(cfg: &StormConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let id = if cfg.node_id.is_empty() {
            NodeId::random()
        } else {
            NodeId::from(cfg.node_id.as_str())
        };
        let local = ClusterNode::new_primary(
            id,
            cfg.advertise_host(),
            cfg.port,
            cfg.cluster.gossip_port,
        );

        let mut coordinator = Self::new(
            local,
            cfg.gossip_bind_addr()?,
            cfg.gossip_config(),
            cfg.failover_config(),
        );
        coordinator.seeds = cfg
            .cluster
            .seeds
            .iter()
            .map(|s| parse_seed(s))
            .collect::<Result<_, _>>()?;

        if cfg.cluster.bootstrap {
            let all = SlotRange::new(0, SLOT_COUNT - 1)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            coordinator
                .registry
                .assign_slots(&[all])
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            info!("bootstrapped as the owner of all {SLOT_COUNT} slots");
        }
        Ok(coordinator)
    }

    pub fn local_id(&self) -> &NodeId {
        self.registry.local_id()
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &SlotRouter {
        &self.router
    }

    pub fn gossip(&self) -> &Arc<GossipService> {
        &self.gossip
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub fn migrator(&self) -> &SlotMigrator {
        &self.migrator
    }

    /// Starts gossip and the event consumer, then meets the seeds.
    ///
    /// Unreachable seeds are logged and skipped; the periodic ping keeps
    /// retrying them. Returns the bound gossip address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ClusterError> {
        let rx = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ClusterError::Configuration("coordinator already started".into()))?;

        let addr = self.gossip.start().await?;
        self.tracker.spawn(Arc::clone(self).consume_events(rx));

        for (host, port) in &self.seeds {
            if let Err(e) = self.gossip.meet(host, *port).await {
                warn!("seed {host}:{port} did not answer: {e}");
            }
        }
        info!(
            "node {} up: gossip on {}, {} seeds",
            self.local_id(),
            addr,
            self.seeds.len()
        );
        Ok(addr)
    }

    async fn consume_events(self: Arc<Self>, mut rx: mpsc::Receiver<GossipEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event);
        }
        debug!("gossip event consumer stopped");
    }

    fn handle_event(&self, event: GossipEvent) {
        match event {
            GossipEvent::NodeDiscovered(id) => info!("cluster: node {id} joined"),
            GossipEvent::NodeRecovered(id) => info!("cluster: node {id} is reachable again"),
            GossipEvent::FailReported { reporter, target } => {
                info!("cluster: {reporter} reports {target} as failed");
            }
            GossipEvent::NodeFailed { id, role } => {
                if role != NodeRole::Primary {
                    warn!("cluster: replica {id} failed");
                    return;
                }
                warn!("cluster: primary {id} failed, starting failover");
                match self.failover.trigger(&id) {
                    Ok(generation) => debug!("failover {generation} armed for {id}"),
                    Err(e) => warn!("failover for {id} not started: {e}"),
                }
            }
        }
    }

    /// Introduces this node to the gossip endpoint `host:port`.
    pub async fn meet(&self, host: &str, port: u16) -> Result<(), ClusterError> {
        self.gossip.meet(host, port).await
    }

    /// Drops a node from the local registry.
    pub fn forget(&self, id: &NodeId) -> Result<ClusterNode, ClusterError> {
        let node = self.registry.remove_node(id)?;
        info!("forgot node {id}");
        Ok(node)
    }

    /// Whether this node is currently fit to serve.
    pub fn is_online(&self) -> bool {
        self.registry
            .local_node()
            .is_some_and(|n| n.state == NodeState::Online)
    }

    /// Stops every background task. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.gossip.shutdown().await;
        self.failover.shutdown().await;
        self.tracker.wait().await;
    }
}
