//! Operator-driven slot migration between two nodes.
//!
//! The migrator only tracks the session and flips ownership at the end.
//! Moving the keys themselves is the storage layer's job; it reports back
//! through [`SlotMigrator::update_progress`]. Until [`SlotMigrator::complete`]
//! the source keeps serving every slot in the set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use crate::slots::SLOT_COUNT;
use crate::topology::NodeId;
use crate::{ClusterRegistry, SlotRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    None,
    Migrating,
    Completed,
    Cancelled,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::None => write!(f, "none"),
            MigrationState::Migrating => write!(f, "migrating"),
            MigrationState::Completed => write!(f, "completed"),
            MigrationState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("a migration is already in progress")]
    AlreadyMigrating,

    #[error("no migration in progress (state is {0})")]
    NotMigrating(MigrationState),

    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    #[error("source and target are the same node")]
    SameNode,

    #[error("no slots given")]
    NoSlots,

    #[error("slot {0} out of range")]
    SlotOutOfRange(u16),

    #[error("slot {slot} is not owned by {source_id}")]
    NotOwned { slot: u16, source_id: NodeId },

    #[error("target {0} left the cluster")]
    TargetVanished(NodeId),
}

#[derive(Debug, Default)]
struct Session {
    state: Option<MigrationState>,
    source: Option<NodeId>,
    target: Option<NodeId>,
    slots: Vec<u16>,
    progress: f64,
    bytes: u64,
    started_at: Option<Instant>,
}

/// Point-in-time view of the migration session.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub state: MigrationState,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    pub slots: Vec<SlotRange>,
    pub slot_count: usize,
    pub progress: f64,
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
}

pub struct SlotMigrator {
    registry: Arc<ClusterRegistry>,
    session: Mutex<Session>,
    completed: AtomicU64,
}

impl std::fmt::Debug for SlotMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotMigrator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SlotMigrator {
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self {
            registry,
            session: Mutex::new(Session::default()),
            completed: AtomicU64::new(0),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> MigrationState {
        self.session().state.unwrap_or(MigrationState::None)
    }

    pub fn is_migrating(&self) -> bool {
        self.state() == MigrationState::Migrating
    }

    /// Number of migrations completed by this migrator.
    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Opens a session moving `slots` from `source` to `target`.
    ///
    /// Every slot must currently be owned by `source` in the slot table.
    /// Duplicates are dropped. Progress starts at zero.
    pub fn start_migration(
        &self,
        source: &NodeId,
        target: &NodeId,
        mut slots: Vec<u16>,
    ) -> Result<(), MigrationError> {
        let mut session = self.session();
        if session.state == Some(MigrationState::Migrating) {
            return Err(MigrationError::AlreadyMigrating);
        }
        if slots.is_empty() {
            return Err(MigrationError::NoSlots);
        }
        if source == target {
            return Err(MigrationError::SameNode);
        }
        slots.sort_unstable();
        slots.dedup();

        {
            let state = self.registry.read();
            for id in [source, target] {
                if !state.contains(id) {
                    return Err(MigrationError::NodeNotFound(id.clone()));
                }
            }
            for &slot in &slots {
                if slot >= SLOT_COUNT {
                    return Err(MigrationError::SlotOutOfRange(slot));
                }
                if state.slot_map().owner(slot) != Some(source) {
                    return Err(MigrationError::NotOwned {
                        slot,
                        source_id: source.clone(),
                    });
                }
            }
        }

        info!(
            "migration started: {} slots from {} to {}",
            slots.len(),
            source,
            target
        );
        *session = Session {
            state: Some(MigrationState::Migrating),
            source: Some(source.clone()),
            target: Some(target.clone()),
            slots,
            progress: 0.0,
            bytes: 0,
            started_at: Some(Instant::now()),
        };
        Ok(())
    }

    /// Records transfer progress. Always overwrites, whatever the state.
    pub fn update_progress(&self, progress: f64, bytes: u64) {
        let mut session = self.session();
        session.progress = progress;
        session.bytes = bytes;
    }

    /// Hands every slot in the session to the target in one registry write.
    pub fn complete(&self) -> Result<MigrationStatus, MigrationError> {
        let mut session = self.session();
        let current = session.state.unwrap_or(MigrationState::None);
        if current != MigrationState::Migrating {
            return Err(MigrationError::NotMigrating(current));
        }
        let (Some(source), Some(target)) = (session.source.clone(), session.target.clone()) else {
            return Err(MigrationError::NotMigrating(current));
        };

        {
            let mut state = self.registry.write();
            if !state.contains(&target) {
                warn!("migration target {} vanished, leaving session open", target);
                return Err(MigrationError::TargetVanished(target));
            }

            let previous = state.repoint_slots(&session.slots, &target);
            if let Some(node) = state.node_mut(&target) {
                append_slots(&mut node.slots, &session.slots);
            }
            for id in previous.iter().chain(std::iter::once(&source)) {
                if *id != target {
                    state.refresh_ranges(id);
                }
            }
        }

        session.state = Some(MigrationState::Completed);
        session.progress = 100.0;
        info!(
            "migration completed: {} slots now owned by {}",
            session.slots.len(),
            target
        );
        counter!("storm_migrations_completed_total").increment(1);
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(status_of(&session))
    }

    /// Marks the session cancelled. Ownership is untouched.
    pub fn cancel(&self) {
        let mut session = self.session();
        if session.state == Some(MigrationState::Migrating) {
            info!("migration cancelled");
        }
        session.state = Some(MigrationState::Cancelled);
        session.progress = 0.0;
        session.bytes = 0;
    }

    pub fn status(&self) -> MigrationStatus {
        status_of(&self.session())
    }
}

fn status_of(session: &Session) -> MigrationStatus {
    MigrationStatus {
        state: session.state.unwrap_or(MigrationState::None),
        source: session.source.clone(),
        target: session.target.clone(),
        slots: SlotRange::from_slots(session.slots.iter().copied()),
        slot_count: session.slots.len(),
        progress: session.progress,
        bytes_transferred: session.bytes,
        elapsed_ms: session
            .started_at
            .map_or(0, |t| t.elapsed().as_millis() as u64),
    }
}

/// Appends slots to a range list, extending only the last range.
///
/// Slots already covered by any range are skipped.
fn append_slots(ranges: &mut Vec<SlotRange>, slots: &[u16]) {
    for &slot in slots {
        if ranges.iter().any(|r| r.contains(slot)) {
            continue;
        }
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(slot) => last.end = slot,
            _ => ranges.push(SlotRange::single(slot)),
        }
    }
}
