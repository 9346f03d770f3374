//! Key routing: key to slot, slot to owner, and redirect metadata.

use std::sync::Arc;

use serde::Serialize;

use crate::slots::key_slot;
use crate::topology::ClusterNode;
use crate::{ClusterError, ClusterRegistry};

/// Where a client should go for a key.
///
/// `addr` is empty and `port` is zero when the slot has no owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub slot: u16,
    pub addr: String,
    pub port: u16,
}

impl Redirect {
    pub fn has_owner(&self) -> bool {
        !self.addr.is_empty()
    }
}

impl std::fmt::Display for Redirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MOVED {} {}:{}", self.slot, self.addr, self.port)
    }
}

/// Read-only routing over the registry's slot table.
#[derive(Debug, Clone)]
pub struct SlotRouter {
    registry: Arc<ClusterRegistry>,
}

impl SlotRouter {
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self { registry }
    }

    pub fn slot(&self, key: &[u8]) -> u16 {
        key_slot(key)
    }

    /// The node owning `slot`, or `None` when unassigned or dangling.
    pub fn owner_of(&self, slot: u16) -> Option<ClusterNode> {
        self.registry.read().slot_owner(slot).cloned()
    }

    pub fn node_for_key(&self, key: &[u8]) -> Option<ClusterNode> {
        self.owner_of(key_slot(key))
    }

    /// True when this node owns the key's slot, or nobody does.
    ///
    /// Unowned slots are served locally so a cluster that has not been
    /// partitioned yet still accepts traffic.
    pub fn is_local(&self, key: &[u8]) -> bool {
        let state = self.registry.read();
        match state.slot_owner(key_slot(key)) {
            Some(owner) => owner.id == *state.local_id(),
            None => true,
        }
    }

    /// Redirect metadata for `key`. Never fails.
    pub fn redirect_info(&self, key: &[u8]) -> Redirect {
        let slot = key_slot(key);
        match self.owner_of(slot) {
            Some(owner) => Redirect {
                slot,
                addr: owner.addr,
                port: owner.port,
            },
            None => Redirect {
                slot,
                addr: String::new(),
                port: 0,
            },
        }
    }

    /// `Ok` when the key can be served here, otherwise a MOVED error.
    pub fn check_key(&self, key: &[u8]) -> Result<(), ClusterError> {
        if self.is_local(key) {
            return Ok(());
        }
        let redirect = self.redirect_info(key);
        Err(ClusterError::moved(redirect.slot, redirect.addr, redirect.port))
    }
}
