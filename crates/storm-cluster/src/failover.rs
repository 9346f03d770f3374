//! Failover election state machine.
//!
//! ```text
//!            start_failover           election delay            quorum of votes
//!   None ─────────────────▶ Waiting ────────────────▶ InProgress ──────────────▶ Completed
//!     ▲                        │  no online replica        │  vote timeout
//!     └────────────────────────┴───────────────────────────┘
//! ```
//!
//! A session snapshots the failed primary's slots when it starts. After the
//! election delay the online replica with the highest replication offset
//! becomes the candidate; ties go to the lexicographically smallest node ID.
//! Votes for the candidate are counted once per voter, and reaching quorum
//! (a majority of all known primaries, the failed one included) promotes
//! the candidate and hands it the snapshotted slots in one registry write.
//!
//! Only one session is active at a time. `Completed` counts as idle, so a
//! new failure can start the next session right away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::topology::{NodeId, NodeRole, NodeState};
use crate::{ClusterRegistry, SlotRange};

/// Phase of the current failover session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverState {
    None,
    Waiting,
    InProgress,
    Completed,
}

impl FailoverState {
    /// True while a session holds the manager.
    pub fn is_active(&self) -> bool {
        matches!(self, FailoverState::Waiting | FailoverState::InProgress)
    }
}

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverState::None => write!(f, "none"),
            FailoverState::Waiting => write!(f, "waiting"),
            FailoverState::InProgress => write!(f, "in_progress"),
            FailoverState::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Pause between the trigger and candidate selection, giving replicas
    /// time to report their latest offsets.
    pub election_delay: Duration,
    /// An election without quorum after this long is abandoned.
    /// `None` waits forever.
    pub vote_timeout: Option<Duration>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            election_delay: Duration::from_secs(2),
            vote_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailoverError {
    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    #[error("node {0} is not a primary")]
    NotPrimary(NodeId),

    #[error("a failover is already {state}")]
    AlreadyActive { state: FailoverState },

    #[error("no election in progress (state is {state})")]
    NotInProgress { state: FailoverState },

    #[error("vote for {got} does not match the current candidate {expected}")]
    CandidateMismatch { expected: NodeId, got: NodeId },

    #[error("candidate {0} left the cluster before promotion")]
    CandidateVanished(NodeId),
}

/// Result of an accepted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteOutcome {
    /// The vote was counted (or was a repeat); quorum not reached yet.
    Pending { votes: usize, quorum: usize },
    /// This vote reached quorum and the candidate was promoted.
    Promoted {
        new_primary: NodeId,
        demoted: NodeId,
        slots: usize,
    },
}

/// Votes collected for one candidate.
#[derive(Debug)]
struct Election {
    candidate: NodeId,
    quorum: usize,
    votes: HashMap<NodeId, bool>,
}

impl Election {
    fn new(candidate: NodeId, quorum: usize) -> Self {
        Self {
            candidate,
            quorum,
            votes: HashMap::new(),
        }
    }

    /// Majority of `primaries`.
    fn quorum(primaries: usize) -> usize {
        primaries / 2 + 1
    }

    /// Records an affirmative vote. Returns `true` once quorum is reached.
    fn record_vote(&mut self, voter: NodeId) -> bool {
        self.votes.insert(voter, true);
        self.granted() >= self.quorum
    }

    fn granted(&self) -> usize {
        self.votes.values().filter(|&&v| v).count()
    }
}

#[derive(Debug)]
struct Session {
    state: FailoverState,
    generation: u64,
    failed_node: Option<NodeId>,
    failed_slots: Vec<SlotRange>,
    quorum: usize,
    election: Option<Election>,
    started_at: Option<Instant>,
    last_promoted: Option<NodeId>,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: FailoverState::None,
            generation: 0,
            failed_node: None,
            failed_slots: Vec::new(),
            quorum: 0,
            election: None,
            started_at: None,
            last_promoted: None,
        }
    }

    /// Drops session data, keeping the generation counter and history.
    fn reset(&mut self, state: FailoverState) {
        self.state = state;
        self.failed_node = None;
        self.failed_slots.clear();
        self.quorum = 0;
        self.election = None;
        self.started_at = None;
    }
}

/// Snapshot of the failover session for operators.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverStatus {
    pub state: FailoverState,
    pub generation: u64,
    pub failed_node: Option<NodeId>,
    pub failed_slots: usize,
    pub candidate: Option<NodeId>,
    pub votes: usize,
    pub quorum: usize,
    pub elapsed_ms: u64,
    pub last_promoted: Option<NodeId>,
}

/// Owns the single failover session of this process.
pub struct FailoverManager {
    registry: Arc<ClusterRegistry>,
    config: FailoverConfig,
    session: Mutex<Session>,
    completed: AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field("state", &self.session().state)
            .finish_non_exhaustive()
    }
}

impl FailoverManager {
    pub fn new(registry: Arc<ClusterRegistry>, config: FailoverConfig) -> Self {
        Self {
            registry,
            config,
            session: Mutex::new(Session::idle()),
            completed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> FailoverState {
        self.session().state
    }

    /// Number of failovers completed by this manager.
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Opens a session for `failed` and returns its generation.
    ///
    /// Does not arm the election timer; see [`trigger`](Self::trigger).
    pub fn start_failover(&self, failed: &NodeId) -> Result<u64, FailoverError> {
        let mut session = self.session();
        if session.state.is_active() {
            return Err(FailoverError::AlreadyActive {
                state: session.state,
            });
        }

        let (slots, primaries) = {
            let state = self.registry.read();
            let node = state
                .node(failed)
                .ok_or_else(|| FailoverError::NodeNotFound(failed.clone()))?;
            if node.role != NodeRole::Primary {
                return Err(FailoverError::NotPrimary(failed.clone()));
            }
            (state.slot_map().slots_for_node(failed), state.primaries().count())
        };

        session.generation += 1;
        session.state = FailoverState::Waiting;
        session.failed_node = Some(failed.clone());
        session.failed_slots = slots;
        session.quorum = Election::quorum(primaries);
        session.election = None;
        session.started_at = Some(Instant::now());

        info!(
            "failover {} started for {}: {} slot ranges, quorum {} of {} primaries",
            session.generation,
            failed,
            session.failed_slots.len(),
            session.quorum,
            primaries
        );
        Ok(session.generation)
    }

    /// Starts a session and arms its timers on the runtime.
    ///
    /// The election runs after `election_delay`; if it yields a candidate
    /// and `vote_timeout` is set, the session expires after that long
    /// without quorum.
    pub fn trigger(self: &Arc<Self>, failed: &NodeId) -> Result<u64, FailoverError> {
        let generation = self.start_failover(failed)?;
        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = manager.cancel.cancelled() => return,
                _ = tokio::time::sleep(manager.config.election_delay) => {}
            }
            if manager.run_election(generation) != FailoverState::InProgress {
                return;
            }
            let Some(limit) = manager.config.vote_timeout else {
                return;
            };
            tokio::select! {
                biased;
                _ = manager.cancel.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    manager.expire(generation);
                }
            }
        });
        Ok(generation)
    }

    /// Picks the candidate for session `generation`.
    ///
    /// Stale generations and sessions not in `Waiting` are left alone.
    /// Returns the resulting state.
    pub fn run_election(&self, generation: u64) -> FailoverState {
        let mut session = self.session();
        if session.generation != generation || session.state != FailoverState::Waiting {
            return session.state;
        }
        let Some(failed) = session.failed_node.clone() else {
            session.reset(FailoverState::None);
            return session.state;
        };

        let candidate = {
            let state = self.registry.read();
            state
                .replicas_of(&failed)
                .filter(|n| n.state == NodeState::Online)
                .max_by(|a, b| {
                    a.replication_offset
                        .cmp(&b.replication_offset)
                        .then_with(|| b.id.cmp(&a.id))
                })
                .map(|n| (n.id.clone(), n.replication_offset))
        };

        match candidate {
            Some((id, offset)) => {
                info!(
                    "failover {}: candidate {} (offset {}), need {} votes",
                    generation, id, offset, session.quorum
                );
                let quorum = session.quorum;
                session.election = Some(Election::new(id, quorum));
                session.state = FailoverState::InProgress;
            }
            None => {
                warn!(
                    "failover {}: no online replica of {}, slots stay orphaned",
                    generation, failed
                );
                session.reset(FailoverState::None);
            }
        }
        session.state
    }

    /// Counts `voter`'s vote for `candidate`.
    ///
    /// Rejected without effect unless an election is in progress for that
    /// exact candidate. Reaching quorum promotes the candidate.
    pub fn vote(&self, voter: NodeId, candidate: &NodeId) -> Result<VoteOutcome, FailoverError> {
        let mut session = self.session();
        if session.state != FailoverState::InProgress {
            return Err(FailoverError::NotInProgress {
                state: session.state,
            });
        }
        let Some(election) = session.election.as_mut() else {
            return Err(FailoverError::NotInProgress {
                state: session.state,
            });
        };
        if election.candidate != *candidate {
            return Err(FailoverError::CandidateMismatch {
                expected: election.candidate.clone(),
                got: candidate.clone(),
            });
        }

        info!("failover vote from {} for {}", voter, candidate);
        if !election.record_vote(voter) {
            return Ok(VoteOutcome::Pending {
                votes: election.granted(),
                quorum: election.quorum,
            });
        }

        self.complete(&mut session)
    }

    /// Promotes the candidate. Runs with the session lock held and takes
    /// the registry write lock inside it.
    fn complete(&self, session: &mut Session) -> Result<VoteOutcome, FailoverError> {
        let (Some(failed), Some(election)) = (session.failed_node.clone(), session.election.take())
        else {
            session.reset(FailoverState::None);
            return Err(FailoverError::NotInProgress {
                state: FailoverState::None,
            });
        };
        let candidate = election.candidate;

        let mut state = self.registry.write();
        if !state.contains(&candidate) {
            warn!("failover {}: candidate {} vanished", session.generation, candidate);
            session.reset(FailoverState::None);
            return Err(FailoverError::CandidateVanished(candidate));
        }

        if let Some(node) = state.node_mut(&candidate) {
            node.role = NodeRole::Primary;
            node.replica_of = None;
        }
        if let Some(node) = state.node_mut(&failed) {
            node.role = NodeRole::Replica;
            node.replica_of = Some(candidate.clone());
            // it has to resync from the new primary before serving again
            node.state = NodeState::Joining;
        }
        let slots: usize = session.failed_slots.iter().map(SlotRange::len).sum();
        if let Err(e) = state.claim_slots(&candidate, &session.failed_slots) {
            warn!("failover {}: slot handoff failed: {e}", session.generation);
        }
        drop(state);

        info!(
            "failover {} completed: {} promoted, {} slots moved from {}",
            session.generation, candidate, slots, failed
        );
        counter!("storm_failovers_completed_total").increment(1);
        self.completed.fetch_add(1, Ordering::Relaxed);
        session.last_promoted = Some(candidate.clone());
        session.reset(FailoverState::Completed);

        Ok(VoteOutcome::Promoted {
            new_primary: candidate,
            demoted: failed,
            slots,
        })
    }

    /// Abandons session `generation` if it is still waiting for votes.
    pub fn expire(&self, generation: u64) -> bool {
        let mut session = self.session();
        if session.generation != generation || session.state != FailoverState::InProgress {
            return false;
        }
        warn!(
            "failover {} timed out with {} of {} votes",
            generation,
            session.election.as_ref().map_or(0, Election::granted),
            session.quorum
        );
        session.reset(FailoverState::None);
        true
    }

    /// Drops any active session. Returns whether one was active.
    pub fn abort(&self) -> bool {
        let mut session = self.session();
        if !session.state.is_active() {
            return false;
        }
        info!("failover {} aborted", session.generation);
        session.reset(FailoverState::None);
        true
    }

    pub fn status(&self) -> FailoverStatus {
        let session = self.session();
        FailoverStatus {
            state: session.state,
            generation: session.generation,
            failed_node: session.failed_node.clone(),
            failed_slots: session.failed_slots.iter().map(SlotRange::len).sum(),
            candidate: session.election.as_ref().map(|e| e.candidate.clone()),
            votes: session.election.as_ref().map_or(0, Election::granted),
            quorum: session.quorum,
            elapsed_ms: session
                .started_at
                .map_or(0, |t| t.elapsed().as_millis() as u64),
            last_promoted: session.last_promoted.clone(),
        }
    }

    /// Cancels pending timers and waits for them. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ClusterNode;
    use crate::SLOT_COUNT;

    fn online_primary(id: &str, port: u16) -> ClusterNode {
        ClusterNode::new_primary(NodeId::from(id), "127.0.0.1", port, port + 1000)
            .with_state(NodeState::Online)
    }

    fn replica(id: &str, port: u16, of: &str, offset: u64) -> ClusterNode {
        let mut node =
            ClusterNode::new_replica(NodeId::from(id), "127.0.0.1", port, port + 1000, NodeId::from(of))
                .with_state(NodeState::Online);
        node.replication_offset = offset;
        node
    }

    /// node-1 (local) .. node-`primaries`, balanced.
    fn cluster(primaries: u16) -> Arc<ClusterRegistry> {
        let registry = Arc::new(ClusterRegistry::new(online_primary("node-1", 7001)));
        for i in 2..=primaries {
            registry
                .add_node(online_primary(&format!("node-{i}"), 7000 + i))
                .unwrap();
        }
        registry.balance_slots();
        registry
    }

    fn manager(registry: &Arc<ClusterRegistry>) -> FailoverManager {
        FailoverManager::new(Arc::clone(registry), FailoverConfig::default())
    }

    #[test]
    fn quorum_is_majority() {
        assert_eq!(Election::quorum(1), 1);
        assert_eq!(Election::quorum(3), 2);
        assert_eq!(Election::quorum(4), 3);
        assert_eq!(Election::quorum(5), 3);
    }

    #[test]
    fn start_rejects_unknown_and_replica() {
        let registry = cluster(3);
        registry.add_node(replica("r1", 7100, "node-2", 10)).unwrap();
        let fm = manager(&registry);

        assert_eq!(
            fm.start_failover(&NodeId::from("ghost")),
            Err(FailoverError::NodeNotFound(NodeId::from("ghost")))
        );
        assert_eq!(
            fm.start_failover(&NodeId::from("r1")),
            Err(FailoverError::NotPrimary(NodeId::from("r1")))
        );
        assert_eq!(fm.state(), FailoverState::None);
    }

    #[test]
    fn second_start_is_refused_while_active() {
        let registry = cluster(3);
        let fm = manager(&registry);
        fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert_eq!(
            fm.start_failover(&NodeId::from("node-3")),
            Err(FailoverError::AlreadyActive {
                state: FailoverState::Waiting
            })
        );
        assert_eq!(fm.status().failed_node, Some(NodeId::from("node-2")));
    }

    #[test]
    fn election_without_online_replica_resets() {
        let registry = cluster(3);
        let mut offline = replica("r1", 7100, "node-2", 10);
        offline.state = NodeState::Failed;
        registry.add_node(offline).unwrap();
        let fm = manager(&registry);

        let generation = fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert_eq!(fm.run_election(generation), FailoverState::None);
        // slots stay with the failed node
        assert_eq!(registry.slot_distribution()[&NodeId::from("node-2")], 5461);
    }

    #[test]
    fn highest_offset_wins_and_ties_break_by_id() {
        let registry = cluster(3);
        registry.add_node(replica("r-b", 7101, "node-2", 500)).unwrap();
        registry.add_node(replica("r-a", 7102, "node-2", 500)).unwrap();
        registry.add_node(replica("r-c", 7103, "node-2", 100)).unwrap();
        registry.add_node(replica("r-z", 7104, "node-3", 9_999)).unwrap();
        let fm = manager(&registry);

        let generation = fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert_eq!(fm.run_election(generation), FailoverState::InProgress);
        assert_eq!(fm.status().candidate, Some(NodeId::from("r-a")));
    }

    #[test]
    fn stale_generation_is_ignored() {
        let registry = cluster(3);
        registry.add_node(replica("r1", 7100, "node-2", 1)).unwrap();
        let fm = manager(&registry);
        let generation = fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert!(fm.abort());
        let next = fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert_eq!(fm.run_election(generation), FailoverState::Waiting);
        assert_eq!(fm.run_election(next), FailoverState::InProgress);
    }

    #[test]
    fn votes_require_matching_candidate_and_progress() {
        let registry = cluster(3);
        registry.add_node(replica("r1", 7100, "node-2", 1)).unwrap();
        let fm = manager(&registry);

        assert!(matches!(
            fm.vote(NodeId::from("node-1"), &NodeId::from("r1")),
            Err(FailoverError::NotInProgress { .. })
        ));
        let generation = fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert!(matches!(
            fm.vote(NodeId::from("node-1"), &NodeId::from("r1")),
            Err(FailoverError::NotInProgress {
                state: FailoverState::Waiting
            })
        ));
        fm.run_election(generation);
        assert!(matches!(
            fm.vote(NodeId::from("node-1"), &NodeId::from("node-3")),
            Err(FailoverError::CandidateMismatch { .. })
        ));
        assert_eq!(fm.status().votes, 0);
    }

    #[test]
    fn quorum_of_three_promotes_on_third_vote() {
        // five primaries: quorum 3
        let registry = cluster(5);
        registry.add_node(replica("r1", 7100, "node-2", 42)).unwrap();
        registry.set_state(&NodeId::from("node-2"), NodeState::Failed).unwrap();
        let failed_slots: Vec<u16> = registry
            .read()
            .slot_map()
            .iter()
            .filter(|(_, o)| *o == Some(&NodeId::from("node-2")))
            .map(|(s, _)| s)
            .collect();
        let fm = manager(&registry);

        let generation = fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert_eq!(fm.status().quorum, 3);
        fm.run_election(generation);

        let r1 = NodeId::from("r1");
        assert_eq!(
            fm.vote(NodeId::from("node-1"), &r1).unwrap(),
            VoteOutcome::Pending { votes: 1, quorum: 3 }
        );
        // duplicate vote does not count twice
        assert_eq!(
            fm.vote(NodeId::from("node-1"), &r1).unwrap(),
            VoteOutcome::Pending { votes: 1, quorum: 3 }
        );
        assert_eq!(
            fm.vote(NodeId::from("node-3"), &r1).unwrap(),
            VoteOutcome::Pending { votes: 2, quorum: 3 }
        );
        assert_eq!(fm.state(), FailoverState::InProgress);

        let outcome = fm.vote(NodeId::from("node-4"), &r1).unwrap();
        assert_eq!(
            outcome,
            VoteOutcome::Promoted {
                new_primary: r1.clone(),
                demoted: NodeId::from("node-2"),
                slots: failed_slots.len(),
            }
        );
        assert_eq!(fm.state(), FailoverState::Completed);
        assert_eq!(fm.completed_count(), 1);

        let state = registry.read();
        for slot in &failed_slots {
            assert_eq!(state.slot_map().owner(*slot), Some(&r1));
        }
        assert_eq!(state.slot_map().slot_counts()[&r1], failed_slots.len());
        let promoted = state.node(&r1).unwrap();
        assert_eq!(promoted.role, NodeRole::Primary);
        assert!(promoted.replica_of.is_none());
        assert_eq!(promoted.slot_count(), failed_slots.len());
        let demoted = state.node(&NodeId::from("node-2")).unwrap();
        assert_eq!(demoted.role, NodeRole::Replica);
        assert_eq!(demoted.replica_of, Some(r1.clone()));
        assert!(demoted.slots.is_empty());
        assert_eq!(state.slot_map().assigned_count(), SLOT_COUNT as usize);
    }

    #[test]
    fn completed_session_accepts_a_new_trigger() {
        let registry = cluster(1);
        registry.add_node(replica("r1", 7100, "node-1", 0)).unwrap();
        let fm = manager(&registry);

        let generation = fm.start_failover(&NodeId::from("node-1")).unwrap();
        fm.run_election(generation);
        assert!(matches!(
            fm.vote(NodeId::from("node-1"), &NodeId::from("r1")).unwrap(),
            VoteOutcome::Promoted { .. }
        ));
        assert!(matches!(
            fm.vote(NodeId::from("node-1"), &NodeId::from("r1")),
            Err(FailoverError::NotInProgress {
                state: FailoverState::Completed
            })
        ));
        assert!(fm.start_failover(&NodeId::from("r1")).is_ok());
    }

    #[test]
    fn vanished_candidate_aborts() {
        let registry = cluster(1);
        registry.add_node(replica("r1", 7100, "node-1", 0)).unwrap();
        let fm = manager(&registry);
        let generation = fm.start_failover(&NodeId::from("node-1")).unwrap();
        fm.run_election(generation);
        registry.remove_node(&NodeId::from("r1")).unwrap();

        assert_eq!(
            fm.vote(NodeId::from("node-1"), &NodeId::from("r1")),
            Err(FailoverError::CandidateVanished(NodeId::from("r1")))
        );
        assert_eq!(fm.state(), FailoverState::None);
        assert_eq!(
            registry.slot_distribution()[&NodeId::from("node-1")],
            SLOT_COUNT as usize
        );
    }

    #[test]
    fn expire_only_hits_matching_in_progress_session() {
        let registry = cluster(3);
        registry.add_node(replica("r1", 7100, "node-2", 1)).unwrap();
        let fm = manager(&registry);
        let generation = fm.start_failover(&NodeId::from("node-2")).unwrap();
        assert!(!fm.expire(generation));
        fm.run_election(generation);
        assert!(!fm.expire(generation + 1));
        assert!(fm.expire(generation));
        assert_eq!(fm.state(), FailoverState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_runs_election_then_times_out() {
        let registry = cluster(3);
        registry.add_node(replica("r1", 7100, "node-2", 1)).unwrap();
        let fm = Arc::new(FailoverManager::new(
            Arc::clone(&registry),
            FailoverConfig {
                election_delay: Duration::from_millis(200),
                vote_timeout: Some(Duration::from_secs(1)),
            },
        ));

        fm.trigger(&NodeId::from("node-2")).unwrap();
        assert_eq!(fm.state(), FailoverState::Waiting);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fm.state(), FailoverState::InProgress);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fm.state(), FailoverState::None);
        fm.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_election() {
        let registry = cluster(3);
        registry.add_node(replica("r1", 7100, "node-2", 1)).unwrap();
        let fm = Arc::new(FailoverManager::new(
            Arc::clone(&registry),
            FailoverConfig {
                election_delay: Duration::from_secs(60),
                vote_timeout: None,
            },
        ));
        fm.trigger(&NodeId::from("node-2")).unwrap();
        fm.shutdown().await;
        fm.shutdown().await;
        assert_eq!(fm.state(), FailoverState::Waiting);
    }
}
