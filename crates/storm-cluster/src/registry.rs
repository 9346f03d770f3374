//! Shared, synchronized handle to the cluster state.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::topology::{
    ClusterNode, ClusterStats, ClusterState, HealthReport, NodeId, NodeReport, NodeState,
    RebalanceReport,
};
use crate::{ClusterError, SlotRange};

/// The node directory and slot table behind one lock.
///
/// Lookups and health checks take the read side. Every mutation goes
/// through the write side, so a reader never sees a slot table that
/// disagrees with the node map. Components holding their own lock take it
/// before this one, never after.
///
/// A poisoned lock is recovered rather than propagated: every mutator
/// leaves the state consistent before it can panic.
pub struct ClusterRegistry {
    local_id: NodeId,
    state: RwLock<ClusterState>,
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl ClusterRegistry {
    pub fn new(local: ClusterNode) -> Self {
        Self {
            local_id: local.id.clone(),
            state: RwLock::new(ClusterState::new(local)),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ClusterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ClusterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node(&self, id: &NodeId) -> Option<ClusterNode> {
        self.read().node(id).cloned()
    }

    pub fn local_node(&self) -> Option<ClusterNode> {
        self.node(&self.local_id)
    }

    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.read().nodes().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.read().node_count()
    }

    pub fn node_report(&self, id: &NodeId) -> Option<NodeReport> {
        self.read().node_report(id)
    }

    pub fn node_reports(&self) -> Vec<NodeReport> {
        self.read().node_reports()
    }

    pub fn add_node(&self, node: ClusterNode) -> Result<Option<ClusterNode>, ClusterError> {
        self.write().add_node(node)
    }

    pub fn remove_node(&self, id: &NodeId) -> Result<ClusterNode, ClusterError> {
        self.write().remove_node(id)
    }

    /// Sets a node's lifecycle state and returns the previous one.
    pub fn set_state(&self, id: &NodeId, state: NodeState) -> Result<NodeState, ClusterError> {
        let mut guard = self.write();
        let node = guard
            .node_mut(id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.clone()))?;
        Ok(std::mem::replace(&mut node.state, state))
    }

    /// Records the replication offset the storage layer reports for a node.
    pub fn set_replication_offset(&self, id: &NodeId, offset: u64) -> Result<(), ClusterError> {
        let mut guard = self.write();
        let node = guard
            .node_mut(id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.clone()))?;
        node.replication_offset = offset;
        Ok(())
    }

    pub fn assign_slots(&self, ranges: &[SlotRange]) -> Result<(), ClusterError> {
        self.write().assign_slots(ranges)
    }

    pub fn assign_slots_to(&self, node: &NodeId, ranges: &[SlotRange]) -> Result<(), ClusterError> {
        self.write().assign_slots_to(node, ranges)
    }

    pub fn balance_slots(&self) {
        self.write().balance_slots()
    }

    pub fn rebalance(&self) -> Result<RebalanceReport, ClusterError> {
        self.write().rebalance()
    }

    pub fn health(&self) -> HealthReport {
        self.read().health()
    }

    pub fn slot_distribution(&self) -> BTreeMap<NodeId, usize> {
        self.read().slot_distribution()
    }

    pub fn stats(&self) -> ClusterStats {
        self.read().stats()
    }
}
