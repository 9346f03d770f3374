//! Gossip membership engine.
//!
//! Every interval the local node pings each known peer with its full node
//! snapshot. Receivers merge the snapshot and answer with their own, so
//! membership spreads epidemically without a coordinator.
//!
//! Liveness is judged only from direct contact: a message from node X
//! refreshes X's `last_seen`, but X's claims about third parties only ever
//! add nodes we have not heard of. A node silent for longer than
//! `interval * failure_multiplier` is marked failed and a `fail` message is
//! broadcast. Receiving `fail` marks the node failed locally but is
//! advisory; failover is driven by the local detector alone.
//!
//! The engine does no I/O. [`GossipService`](crate::GossipService) owns the
//! sockets and drives it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, info, trace, warn};

use crate::message::{GossipMessage, MessageKind, NodeSnapshot};
use crate::topology::{ClusterNode, NodeId, NodeRole, NodeState};
use crate::ClusterRegistry;

/// Configuration for the gossip protocol.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// How often every peer is pinged.
    pub interval: Duration,
    /// Upper bound on one connect/write/read exchange.
    pub io_timeout: Duration,
    /// A node silent for `interval * failure_multiplier` is failed.
    pub failure_multiplier: u32,
    /// Peers with no pong for this long are forgotten. `None` keeps them.
    pub peer_ttl: Option<Duration>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            io_timeout: Duration::from_secs(2),
            failure_multiplier: 5,
            peer_ttl: Some(Duration::from_secs(300)),
        }
    }
}

impl GossipConfig {
    pub fn failure_threshold(&self) -> Duration {
        self.interval * self.failure_multiplier
    }
}

/// Membership changes observed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipEvent {
    /// A node was added to the registry from a snapshot.
    NodeDiscovered(NodeId),
    /// The local detector marked a node failed.
    NodeFailed { id: NodeId, role: NodeRole },
    /// Another node broadcast a failure report.
    FailReported { reporter: NodeId, target: NodeId },
    /// A failed node was heard from again.
    NodeRecovered(NodeId),
}

/// Bookkeeping for one remote gossip endpoint.
#[derive(Debug, Clone)]
pub struct Peer {
    /// `host:gossip_port`.
    pub endpoint: String,
    /// Known once the endpoint has identified itself.
    pub node_id: Option<NodeId>,
    pub first_seen: Instant,
    pub last_ping_sent: Option<Instant>,
    pub last_pong_received: Option<Instant>,
}

pub struct GossipEngine {
    registry: Arc<ClusterRegistry>,
    config: GossipConfig,
    peers: HashMap<String, Peer>,
    events: Vec<GossipEvent>,
}

impl std::fmt::Debug for GossipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipEngine")
            .field("local_id", self.registry.local_id())
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl GossipEngine {
    pub fn new(registry: Arc<ClusterRegistry>, config: GossipConfig) -> Self {
        Self {
            registry,
            config,
            peers: HashMap::new(),
            events: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        self.registry.local_id()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer(&self, endpoint: &str) -> Option<&Peer> {
        self.peers.get(endpoint)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Registers a gossip endpoint. Returns `true` if it was new.
    ///
    /// The local node's own endpoint is never added.
    pub fn add_peer(&mut self, endpoint: String, node_id: Option<NodeId>) -> bool {
        let own = self.registry.local_node().map(|n| n.gossip_endpoint());
        if own.as_deref() == Some(endpoint.as_str()) || node_id.as_ref() == Some(self.local_id()) {
            return false;
        }
        match self.peers.get_mut(&endpoint) {
            Some(peer) => {
                if node_id.is_some() {
                    peer.node_id = node_id;
                }
                false
            }
            None => {
                debug!("gossip: new peer {endpoint}");
                self.peers.insert(
                    endpoint.clone(),
                    Peer {
                        endpoint,
                        node_id,
                        first_seen: Instant::now(),
                        last_ping_sent: None,
                        last_pong_received: None,
                    },
                );
                true
            }
        }
    }

    /// The local view of every node, in ID order.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let state = self.registry.read();
        state
            .sorted_ids()
            .iter()
            .filter_map(|id| state.node(id))
            .map(NodeSnapshot::from)
            .collect()
    }

    pub fn meet_message(&self) -> GossipMessage {
        GossipMessage::meet(self.local_id().clone(), self.snapshot())
    }

    /// Takes the events accumulated since the last call.
    pub fn drain_events(&mut self) -> Vec<GossipEvent> {
        std::mem::take(&mut self.events)
    }

    /// Applies an incoming message and returns the reply, if any.
    pub fn handle_message(&mut self, msg: GossipMessage) -> Option<GossipMessage> {
        if msg.sender_id == *self.local_id() {
            trace!("ignoring gossip from ourselves");
            return None;
        }
        counter!("storm_gossip_messages_received_total", "type" => msg.kind.as_str()).increment(1);

        self.merge(&msg.sender_id, &msg.nodes);

        match msg.kind {
            MessageKind::Ping | MessageKind::Meet => {
                if msg.kind == MessageKind::Meet {
                    info!("node {} introduced itself", msg.sender_id);
                } else {
                    trace!("ping from {}", msg.sender_id);
                }
                Some(GossipMessage::pong(self.local_id().clone(), self.snapshot()))
            }
            MessageKind::Pong => {
                trace!("pong from {}", msg.sender_id);
                let now = Instant::now();
                for peer in self.peers.values_mut() {
                    if peer.node_id.as_ref() == Some(&msg.sender_id) {
                        peer.last_pong_received = Some(now);
                    }
                }
                None
            }
            MessageKind::Fail => {
                self.apply_fail_report(&msg.sender_id, msg.target_id.as_ref());
                None
            }
        }
    }

    /// Merges a snapshot sent by `sender`.
    fn merge(&mut self, sender: &NodeId, nodes: &[NodeSnapshot]) {
        let now = Instant::now();
        let mut endpoints = Vec::new();
        {
            let mut state = self.registry.write();
            let local = state.local_id().clone();

            for snap in nodes {
                if snap.id == local {
                    continue;
                }
                let direct = snap.id == *sender;
                if let Some(node) = state.node_mut(&snap.id) {
                    if direct {
                        node.addr.clone_from(&snap.addr);
                        node.port = snap.port;
                        node.gossip_port = snap.gossip_port;
                        adopt_self_reported_role(node, snap);
                        endpoints.push((snap.gossip_endpoint(), snap.id.clone()));
                    }
                    continue;
                }

                let initial = if direct { NodeState::Online } else { snap.state };
                if state.add_node(snap.to_node(initial)).is_ok() {
                    info!("discovered node {} at {}:{} ({})", snap.id, snap.addr, snap.port, snap.role);
                    self.events.push(GossipEvent::NodeDiscovered(snap.id.clone()));
                    endpoints.push((snap.gossip_endpoint(), snap.id.clone()));
                }
            }

            if let Some(node) = state.node_mut(sender) {
                node.last_seen = now;
                match node.state {
                    NodeState::Failed => {
                        info!("node {} is reachable again", sender);
                        node.state = NodeState::Online;
                        self.events.push(GossipEvent::NodeRecovered(sender.clone()));
                    }
                    NodeState::Joining => node.state = NodeState::Online,
                    NodeState::Online | NodeState::Leaving => {}
                }
            }
        }

        for (endpoint, id) in endpoints {
            self.add_peer(endpoint, Some(id));
        }
    }

    fn apply_fail_report(&mut self, reporter: &NodeId, target: Option<&NodeId>) {
        let Some(target) = target else {
            debug!("fail message from {} without target", reporter);
            return;
        };
        if target == self.local_id() {
            warn!("node {} reported this node as failed", reporter);
            return;
        }

        let mut state = self.registry.write();
        let Some(node) = state.node_mut(target) else {
            debug!("fail report from {} for unknown node {}", reporter, target);
            return;
        };
        if node.state != NodeState::Failed {
            info!("node {} reported {} as failed", reporter, target);
            node.state = NodeState::Failed;
        }
        self.events.push(GossipEvent::FailReported {
            reporter: reporter.clone(),
            target: target.clone(),
        });
    }

    /// Builds this interval's pings, one per peer.
    pub fn tick(&mut self) -> Vec<(String, GossipMessage)> {
        if self.peers.is_empty() {
            return Vec::new();
        }
        let ping = GossipMessage::ping(self.local_id().clone(), self.snapshot());
        let now = Instant::now();
        self.peers
            .values_mut()
            .map(|peer| {
                peer.last_ping_sent = Some(now);
                (peer.endpoint.clone(), ping.clone())
            })
            .collect()
    }

    /// Marks every node silent past the failure threshold as failed.
    ///
    /// Returns the newly failed IDs; nodes already failed are skipped.
    pub fn detect_failures(&mut self, now: Instant) -> Vec<NodeId> {
        let threshold = self.config.failure_threshold();
        let mut failed = Vec::new();
        {
            let mut state = self.registry.write();
            let local = state.local_id().clone();
            for id in state.sorted_ids() {
                if id == local {
                    continue;
                }
                let Some(node) = state.node_mut(&id) else {
                    continue;
                };
                if node.state == NodeState::Failed {
                    continue;
                }
                let silent = now.saturating_duration_since(node.last_seen);
                if silent > threshold {
                    warn!("node {} failed: no contact for {:?}", id, silent);
                    node.state = NodeState::Failed;
                    failed.push((id, node.role));
                }
            }
        }

        failed
            .into_iter()
            .map(|(id, role)| {
                counter!("storm_gossip_nodes_failed_total").increment(1);
                self.events.push(GossipEvent::NodeFailed {
                    id: id.clone(),
                    role,
                });
                id
            })
            .collect()
    }

    /// A `fail` message for `target`, addressed to every peer.
    pub fn fail_broadcast(&self, target: &NodeId) -> Vec<(String, GossipMessage)> {
        let msg = GossipMessage::fail(self.local_id().clone(), target.clone());
        self.peers
            .keys()
            .map(|endpoint| (endpoint.clone(), msg.clone()))
            .collect()
    }

    /// Forgets peers that have not answered within the TTL.
    pub fn prune_peers(&mut self, now: Instant) -> usize {
        let Some(ttl) = self.config.peer_ttl else {
            return 0;
        };
        let before = self.peers.len();
        self.peers.retain(|endpoint, peer| {
            let last = peer.last_pong_received.unwrap_or(peer.first_seen);
            let keep = now.saturating_duration_since(last) <= ttl;
            if !keep {
                info!("forgetting gossip peer {endpoint}: no reply for {ttl:?}");
            }
            keep
        });
        before - self.peers.len()
    }
}

/// Applies the role a node reports for itself.
///
/// A node that owns slots in the local table stays a primary: after a local
/// failover the promoted replica keeps describing itself as a replica until
/// its own view catches up.
fn adopt_self_reported_role(node: &mut ClusterNode, snap: &NodeSnapshot) {
    if node.role == snap.role && node.replica_of == snap.replica_of {
        return;
    }
    if node.role == NodeRole::Primary && snap.role == NodeRole::Replica && node.slot_count() > 0 {
        debug!(
            "keeping {} as primary, it owns {} slots here",
            node.id,
            node.slot_count()
        );
        return;
    }
    info!("node {} now reports itself as {}", node.id, snap.role);
    node.role = snap.role;
    node.replica_of.clone_from(&snap.replica_of);
}
