//! Cluster topology: nodes, roles, lifecycle states and the slot table.
//!
//! `ClusterState` is plain data plus the operations that must keep the node
//! map and the slot table consistent with each other. It carries no locks;
//! [`ClusterRegistry`](crate::ClusterRegistry) is the synchronized handle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::slots::{SlotMap, SlotRange, SLOT_COUNT};
use crate::ClusterError;

/// Opaque, cluster-unique node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Generates a random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The role of a node in the cluster.
///
/// On the wire primaries are `"master"` and replicas `"slave"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    #[serde(rename = "master")]
    Primary,
    #[serde(rename = "slave")]
    Replica,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" | "master" => Ok(NodeRole::Primary),
            "replica" | "slave" => Ok(NodeRole::Replica),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Joining,
    Online,
    Failed,
    Leaving,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Joining => "joining",
            NodeState::Online => "online",
            NodeState::Failed => "failed",
            NodeState::Leaving => "leaving",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "joining" => Ok(NodeState::Joining),
            "online" => Ok(NodeState::Online),
            "failed" => Ok(NodeState::Failed),
            "leaving" => Ok(NodeState::Leaving),
            other => Err(format!("unknown node state '{other}'")),
        }
    }
}

/// A node as seen by the local registry.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: NodeId,
    /// Host for client connections.
    pub addr: String,
    /// Port for client connections.
    pub port: u16,
    /// Port of the node's gossip listener (same host as `addr`).
    pub gossip_port: u16,
    pub role: NodeRole,
    pub state: NodeState,
    /// Owned slot ranges. Denormalized from the slot table.
    pub slots: Vec<SlotRange>,
    /// The primary this node replicates, for replicas.
    pub replica_of: Option<NodeId>,
    /// Last direct evidence that the node is alive.
    pub last_seen: Instant,
    /// Replication offset reported by the replication layer.
    pub replication_offset: u64,
}

impl ClusterNode {
    pub fn new_primary(id: NodeId, addr: impl Into<String>, port: u16, gossip_port: u16) -> Self {
        Self {
            id,
            addr: addr.into(),
            port,
            gossip_port,
            role: NodeRole::Primary,
            state: NodeState::Joining,
            slots: Vec::new(),
            replica_of: None,
            last_seen: Instant::now(),
            replication_offset: 0,
        }
    }

    pub fn new_replica(
        id: NodeId,
        addr: impl Into<String>,
        port: u16,
        gossip_port: u16,
        primary: NodeId,
    ) -> Self {
        Self {
            role: NodeRole::Replica,
            replica_of: Some(primary),
            ..Self::new_primary(id, addr, port, gossip_port)
        }
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    pub fn slot_count(&self) -> usize {
        self.slots.iter().map(SlotRange::len).sum()
    }

    /// `host:gossip_port`, the key of this node's gossip peer entry.
    pub fn gossip_endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.gossip_port)
    }
}

/// Overall status reported by a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Fail,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Result of [`ClusterState::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub healthy_nodes: usize,
    pub failed_nodes: usize,
    pub online_primaries: usize,
    pub online_replicas: usize,
    /// Table entries whose owner resolves to a known node.
    pub covered_slots: usize,
    /// Table entries naming a node that is no longer registered.
    pub dangling_slots: usize,
    pub coverage_pct: f64,
}

/// Result of [`ClusterState::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub health: HealthReport,
    pub slot_distribution: BTreeMap<NodeId, usize>,
    pub total_nodes: usize,
    pub min_slots_per_node: usize,
    pub max_slots_per_node: usize,
    pub avg_slots_per_node: f64,
}

/// Result of a successful [`ClusterState::rebalance`].
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceReport {
    pub primaries: usize,
    /// Base share; the first `16384 % primaries` nodes hold one more.
    pub slots_per_node: usize,
    /// Unix seconds.
    pub rebalanced_at: u64,
}

/// Serializable view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub addr: String,
    pub port: u16,
    pub gossip_port: u16,
    pub role: NodeRole,
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica_of: Option<NodeId>,
    pub slots: Vec<String>,
    pub slot_count: usize,
    pub replication_offset: u64,
    pub last_seen_ms: u64,
    pub myself: bool,
}

/// The local node's complete view of the cluster.
#[derive(Debug)]
pub struct ClusterState {
    nodes: HashMap<NodeId, ClusterNode>,
    local_id: NodeId,
    slot_map: SlotMap,
}

impl ClusterState {
    /// Creates a registry view holding only the local node.
    pub fn new(local: ClusterNode) -> Self {
        let local_id = local.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(local_id.clone(), local);
        Self {
            nodes,
            local_id,
            slot_map: SlotMap::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_node(&self) -> Option<&ClusterNode> {
        self.nodes.get(&self.local_id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut ClusterNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn slot_map(&self) -> &SlotMap {
        &self.slot_map
    }

    /// Node IDs in lexicographic order, the deterministic iteration order
    /// for partitioning.
    pub fn sorted_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn primaries(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values().filter(|n| n.role == NodeRole::Primary)
    }

    pub fn replicas_of<'a>(&'a self, primary: &'a NodeId) -> impl Iterator<Item = &'a ClusterNode> {
        self.nodes
            .values()
            .filter(move |n| n.role == NodeRole::Replica && n.replica_of.as_ref() == Some(primary))
    }

    /// Resolves the owner of `slot`. Dangling entries resolve to `None`.
    pub fn slot_owner(&self, slot: u16) -> Option<&ClusterNode> {
        self.slot_map.owner(slot).and_then(|id| self.nodes.get(id))
    }

    /// Inserts or replaces a remote node and returns the previous record.
    ///
    /// The node's range list is rebuilt from the slot table, so a replaced
    /// node keeps whatever the table says it owns.
    pub fn add_node(&mut self, mut node: ClusterNode) -> Result<Option<ClusterNode>, ClusterError> {
        if node.id == self.local_id {
            return Err(ClusterError::LocalNode(node.id));
        }
        node.slots = self.slot_map.slots_for_node(&node.id);
        Ok(self.nodes.insert(node.id.clone(), node))
    }

    /// Removes a remote node from the node map.
    ///
    /// Slot table entries naming the node are left in place and become
    /// dangling until they are reassigned; health reports count them.
    pub fn remove_node(&mut self, id: &NodeId) -> Result<ClusterNode, ClusterError> {
        if *id == self.local_id {
            return Err(ClusterError::LocalNode(id.clone()));
        }
        self.nodes
            .remove(id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.clone()))
    }

    /// Replaces the local node's ranges. See [`assign_slots_to`](Self::assign_slots_to).
    pub fn assign_slots(&mut self, ranges: &[SlotRange]) -> Result<(), ClusterError> {
        let local = self.local_id.clone();
        self.assign_slots_to(&local, ranges)
    }

    /// Makes `ranges` the complete ownership of `node`.
    ///
    /// Slots the node held outside `ranges` are released. Claimed slots are
    /// taken from whoever held them (last writer wins) and those nodes'
    /// range lists are rebuilt, so no two nodes list the same slot.
    pub fn assign_slots_to(&mut self, node: &NodeId, ranges: &[SlotRange]) -> Result<(), ClusterError> {
        if !self.nodes.contains_key(node) {
            return Err(ClusterError::NodeNotFound(node.clone()));
        }
        self.slot_map.release(node);
        self.claim_slots(node, ranges)
    }

    /// Adds `ranges` to `node`'s ownership without releasing anything else.
    pub fn claim_slots(&mut self, node: &NodeId, ranges: &[SlotRange]) -> Result<(), ClusterError> {
        if !self.nodes.contains_key(node) {
            return Err(ClusterError::NodeNotFound(node.clone()));
        }
        let mut previous: Vec<NodeId> = Vec::new();
        for range in ranges {
            for slot in range.iter() {
                if let Some(owner) = self.slot_map.owner(slot) {
                    if owner != node && !previous.contains(owner) {
                        previous.push(owner.clone());
                    }
                }
                self.slot_map.assign(slot, node);
            }
        }
        self.refresh_ranges(node);
        for id in &previous {
            self.refresh_ranges(id);
        }
        Ok(())
    }

    /// Rebuilds a node's range list from the slot table.
    pub fn refresh_ranges(&mut self, id: &NodeId) {
        let ranges = self.slot_map.slots_for_node(id);
        if let Some(node) = self.nodes.get_mut(id) {
            node.slots = ranges;
        }
    }

    /// Points individual slots at `node` without touching any range list.
    ///
    /// Returns the nodes that lost slots so the caller can rebuild their
    /// lists. Migration uses this because it maintains the target's list
    /// itself.
    pub(crate) fn repoint_slots(&mut self, slots: &[u16], node: &NodeId) -> Vec<NodeId> {
        let mut previous: Vec<NodeId> = Vec::new();
        for &slot in slots {
            if let Some(owner) = self.slot_map.owner(slot) {
                if owner != node && !previous.contains(owner) {
                    previous.push(owner.clone());
                }
            }
            self.slot_map.assign(slot, node);
        }
        previous
    }

    /// Splits the whole table evenly across every registered node.
    ///
    /// Nodes are taken in lexicographic ID order and the first
    /// `16384 % n` of them receive one extra slot.
    pub fn balance_slots(&mut self) {
        let ids = self.sorted_ids();
        self.partition(&ids);
        info!(nodes = ids.len(), "balanced slots across all nodes");
    }

    /// Splits the whole table evenly across Online primaries only.
    ///
    /// Every other node ends up owning nothing.
    pub fn rebalance(&mut self) -> Result<RebalanceReport, ClusterError> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.role == NodeRole::Primary && n.state == NodeState::Online)
            .map(|n| n.id.clone())
            .collect();
        if ids.is_empty() {
            return Err(ClusterError::NoOnlinePrimaries);
        }
        ids.sort();
        self.partition(&ids);
        info!(primaries = ids.len(), "rebalanced slots across online primaries");

        Ok(RebalanceReport {
            primaries: ids.len(),
            slots_per_node: SLOT_COUNT as usize / ids.len(),
            rebalanced_at: unix_secs(),
        })
    }

    fn partition(&mut self, ids: &[NodeId]) {
        self.slot_map.clear();
        for node in self.nodes.values_mut() {
            node.slots.clear();
        }
        if ids.is_empty() {
            return;
        }

        let total = SLOT_COUNT as usize;
        let per_node = total / ids.len();
        let remainder = total % ids.len();
        let mut start = 0usize;
        for (i, id) in ids.iter().enumerate() {
            let count = per_node + usize::from(i < remainder);
            if count == 0 {
                continue;
            }
            let range = SlotRange {
                start: start as u16,
                end: (start + count - 1) as u16,
            };
            self.slot_map.assign_range(range, id);
            if let Some(node) = self.nodes.get_mut(id) {
                node.slots = vec![range];
            }
            start += count;
        }
    }

    /// Aggregates node and slot coverage into a status report.
    ///
    /// Any failed node makes the cluster at least degraded; uncovered slots
    /// or zero online primaries make it fail.
    pub fn health(&self) -> HealthReport {
        let mut healthy_nodes = 0;
        let mut failed_nodes = 0;
        let mut online_primaries = 0;
        let mut online_replicas = 0;
        let mut issues = Vec::new();

        for id in self.sorted_ids() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            match node.state {
                NodeState::Online => {
                    healthy_nodes += 1;
                    match node.role {
                        NodeRole::Primary => online_primaries += 1,
                        NodeRole::Replica => online_replicas += 1,
                    }
                }
                NodeState::Failed => {
                    failed_nodes += 1;
                    issues.push(format!("node {} is failed", node.id));
                }
                NodeState::Joining | NodeState::Leaving => {}
            }
        }

        let mut covered_slots = 0;
        let mut dangling_slots = 0;
        for (_, owner) in self.slot_map.iter() {
            match owner {
                Some(id) if self.nodes.contains_key(id) => covered_slots += 1,
                Some(_) => dangling_slots += 1,
                None => {}
            }
        }

        let mut status = HealthStatus::Ok;
        if failed_nodes > 0 {
            status = HealthStatus::Degraded;
        }
        if covered_slots < SLOT_COUNT as usize {
            status = HealthStatus::Fail;
            issues.push(format!(
                "only {covered_slots} of {SLOT_COUNT} slots are covered"
            ));
        }
        if dangling_slots > 0 {
            issues.push(format!("{dangling_slots} slots point at removed nodes"));
        }
        if online_primaries == 0 {
            status = HealthStatus::Fail;
            issues.push("no online primary nodes".to_string());
        }

        HealthReport {
            status,
            issues,
            healthy_nodes,
            failed_nodes,
            online_primaries,
            online_replicas,
            covered_slots,
            dangling_slots,
            coverage_pct: covered_slots as f64 * 100.0 / SLOT_COUNT as f64,
        }
    }

    /// Slots owned per registered node, zero for nodes owning none.
    pub fn slot_distribution(&self) -> BTreeMap<NodeId, usize> {
        let counts = self.slot_map.slot_counts();
        self.nodes
            .keys()
            .map(|id| (id.clone(), counts.get(id).copied().unwrap_or(0)))
            .collect()
    }

    pub fn stats(&self) -> ClusterStats {
        let slot_distribution = self.slot_distribution();
        let (min, max, sum) = slot_distribution.values().fold(
            (usize::MAX, 0usize, 0usize),
            |(min, max, sum), &n| (min.min(n), max.max(n), sum + n),
        );
        let total_nodes = slot_distribution.len();
        let avg = if total_nodes == 0 {
            0.0
        } else {
            sum as f64 / total_nodes as f64
        };

        ClusterStats {
            health: self.health(),
            total_nodes,
            min_slots_per_node: if total_nodes == 0 { 0 } else { min },
            max_slots_per_node: max,
            avg_slots_per_node: avg,
            slot_distribution,
        }
    }

    pub fn node_report(&self, id: &NodeId) -> Option<NodeReport> {
        let node = self.nodes.get(id)?;
        Some(NodeReport {
            id: node.id.clone(),
            addr: node.addr.clone(),
            port: node.port,
            gossip_port: node.gossip_port,
            role: node.role,
            state: node.state,
            replica_of: node.replica_of.clone(),
            slots: node.slots.iter().map(ToString::to_string).collect(),
            slot_count: node.slot_count(),
            replication_offset: node.replication_offset,
            last_seen_ms: node.last_seen.elapsed().as_millis() as u64,
            myself: node.id == self.local_id,
        })
    }

    /// Reports for every node in ID order.
    pub fn node_reports(&self) -> Vec<NodeReport> {
        self.sorted_ids()
            .iter()
            .filter_map(|id| self.node_report(id))
            .collect()
    }
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
