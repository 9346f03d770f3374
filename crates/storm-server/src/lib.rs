//! storm-server: a storm cluster node.
//!
//! The binary in `main.rs` resolves configuration and runs one
//! [`ClusterCoordinator`] with its admin listener. The pieces are exposed
//! as a library so tests can run several nodes in one process.

pub mod admin;
pub mod config;
pub mod coordinator;
pub mod metrics;

pub use admin::{AdminCommand, AdminError, AdminServer};
pub use config::{ConfigError, StormConfig};
pub use coordinator::ClusterCoordinator;
