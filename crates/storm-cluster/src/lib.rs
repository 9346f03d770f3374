//! storm-cluster: cluster coordination for storm.
//!
//! This crate decides which node owns which keys and keeps every node's
//! view of the cluster converging without a central coordinator.
//!
//! # Architecture
//!
//! All components share one [`ClusterRegistry`], the locked view of nodes
//! and the 16384-entry slot table:
//!
//! - **Routing**: [`SlotRouter`] maps keys to slots and slots to owners,
//!   producing `MOVED` redirects for keys served elsewhere
//! - **Membership**: [`GossipService`] pings every peer over TCP with a JSON
//!   snapshot and marks silent nodes failed
//! - **Failover**: [`FailoverManager`] promotes the best replica of a failed
//!   primary once a majority of primaries vote for it
//! - **Migration**: [`SlotMigrator`] moves a slot set between two nodes,
//!   flipping ownership in a single write when the transfer completes
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use storm_cluster::{ClusterNode, ClusterRegistry, NodeId, NodeState, SlotRouter};
//!
//! let local = ClusterNode::new_primary(NodeId::random(), "127.0.0.1", 6379, 16379)
//!     .with_state(NodeState::Online);
//! let registry = Arc::new(ClusterRegistry::new(local));
//! registry.balance_slots();
//!
//! let router = SlotRouter::new(Arc::clone(&registry));
//! assert!(router.is_local(b"user:42"));
//! ```

mod error;
mod failover;
mod gossip;
mod message;
mod migration;
mod registry;
mod router;
mod slots;
mod topology;
mod transport;

pub use error::ClusterError;
pub use failover::{
    FailoverConfig, FailoverError, FailoverManager, FailoverState, FailoverStatus, VoteOutcome,
};
pub use gossip::{GossipConfig, GossipEngine, GossipEvent, Peer};
pub use message::{read_line_limited, GossipMessage, MessageKind, NodeSnapshot, MAX_MESSAGE_LEN};
pub use migration::{MigrationError, MigrationState, MigrationStatus, SlotMigrator};
pub use registry::ClusterRegistry;
pub use router::{Redirect, SlotRouter};
pub use slots::{key_slot, SlotMap, SlotRange, SLOT_COUNT};
pub use topology::{
    ClusterNode, ClusterState, ClusterStats, HealthReport, HealthStatus, NodeId, NodeReport,
    NodeRole, NodeState, RebalanceReport,
};
pub use transport::GossipService;
