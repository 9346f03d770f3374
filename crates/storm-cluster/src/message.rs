//! Gossip wire format.
//!
//! One JSON object per line:
//!
//! ```text
//! {"type":"ping","sender_id":"n1","timestamp":1700000000,"nodes":[...]}
//! {"type":"fail","sender_id":"n1","timestamp":1700000005,"target_id":"n2"}
//! ```
//!
//! Node entries carry `id`, `addr`, `port`, `gossip_port`, `role`
//! (`master`/`slave`), `state` and an optional `replica_of`. Peers may send
//! an empty string for absent IDs; those decode as `None`.

use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::topology::{unix_secs, ClusterNode, NodeId, NodeRole, NodeState};
use crate::ClusterError;

/// Longest gossip line accepted from a peer, newline included.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Reads one line into `buf`, giving up once more than `max` bytes arrive
/// without a newline.
///
/// Returns 0 at end of stream. An overlong line is an `InvalidData` error
/// with `buf` holding the first `max + 1` bytes; the stream is left
/// mid-line, so the connection should be dropped.
pub async fn read_line_limited<R>(
    reader: &mut R,
    buf: &mut String,
    max: usize,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader).take(max as u64 + 1).read_line(buf).await?;
    if n > max && !buf.ends_with('\n') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("line exceeds {max} bytes"),
        ));
    }
    Ok(n)
}

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Ping,
    Pong,
    Meet,
    Fail,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Meet => "meet",
            MessageKind::Fail => "fail",
        }
    }
}

/// A node as described in a gossip snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub addr: String,
    pub port: u16,
    pub gossip_port: u16,
    pub role: NodeRole,
    pub state: NodeState,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub replica_of: Option<NodeId>,
}

impl NodeSnapshot {
    /// Builds a registry record from the snapshot with the given state.
    pub fn to_node(&self, state: NodeState) -> ClusterNode {
        let mut node = ClusterNode::new_primary(self.id.clone(), self.addr.clone(), self.port, self.gossip_port)
            .with_state(state);
        node.role = self.role;
        node.replica_of = self.replica_of.clone();
        node
    }

    pub fn gossip_endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.gossip_port)
    }
}

impl From<&ClusterNode> for NodeSnapshot {
    fn from(node: &ClusterNode) -> Self {
        Self {
            id: node.id.clone(),
            addr: node.addr.clone(),
            port: node.port,
            gossip_port: node.gossip_port,
            role: node.role,
            state: node.state,
            replica_of: node.replica_of.clone(),
        }
    }
}

/// A single gossip message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender_id: NodeId,
    /// Unix seconds at the sender.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeSnapshot>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub target_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u16>,
}

impl GossipMessage {
    fn new(kind: MessageKind, sender_id: NodeId) -> Self {
        Self {
            kind,
            sender_id,
            timestamp: unix_secs(),
            nodes: Vec::new(),
            target_id: None,
            slot: None,
        }
    }

    pub fn ping(sender_id: NodeId, nodes: Vec<NodeSnapshot>) -> Self {
        Self {
            nodes,
            ..Self::new(MessageKind::Ping, sender_id)
        }
    }

    pub fn pong(sender_id: NodeId, nodes: Vec<NodeSnapshot>) -> Self {
        Self {
            nodes,
            ..Self::new(MessageKind::Pong, sender_id)
        }
    }

    pub fn meet(sender_id: NodeId, nodes: Vec<NodeSnapshot>) -> Self {
        Self {
            nodes,
            ..Self::new(MessageKind::Meet, sender_id)
        }
    }

    pub fn fail(sender_id: NodeId, target: NodeId) -> Self {
        Self {
            target_id: Some(target),
            ..Self::new(MessageKind::Fail, sender_id)
        }
    }

    /// Whether the receiver answers this message with a `pong`.
    pub fn expects_reply(&self) -> bool {
        matches!(self.kind, MessageKind::Ping | MessageKind::Meet)
    }

    /// Serializes the message as one newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Parses one line. Surrounding whitespace is ignored.
    pub fn decode(line: &str) -> Result<Self, ClusterError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<NodeId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(NodeId::from))
}
