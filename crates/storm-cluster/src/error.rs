//! Error types for cluster operations.

use crate::NodeId;

/// Errors returned by the registry, router and gossip transport.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A slot range with `start > end` or a slot beyond 16383.
    #[error("invalid slot range {start}-{end} (slots must be 0-16383, start <= end)")]
    InvalidRange { start: u32, end: u32 },

    /// The key belongs to a slot owned by a different node.
    #[error("MOVED {slot} {addr}:{port}")]
    Moved { slot: u16, addr: String, port: u16 },

    /// Node not found in the registry.
    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// The local node cannot be removed or replaced through the registry.
    #[error("operation not allowed on the local node {0}")]
    LocalNode(NodeId),

    /// Rebalance needs at least one online primary.
    #[error("no online primary nodes available for rebalancing")]
    NoOnlinePrimaries,

    /// A gossip line could not be decoded.
    #[error("malformed gossip message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Network error during cluster communication.
    #[error("cluster communication error: {0}")]
    Network(String),

    /// Timeout waiting for a peer.
    #[error("cluster operation timed out")]
    Timeout,

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Returns true if this is a client redirect.
    pub fn is_redirect(&self) -> bool {
        matches!(self, ClusterError::Moved { .. })
    }

    /// Creates a MOVED error for a slot redirect.
    pub fn moved(slot: u16, addr: impl Into<String>, port: u16) -> Self {
        ClusterError::Moved {
            slot,
            addr: addr.into(),
            port,
        }
    }
}
