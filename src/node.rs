//! Cluster membership as seen by the replicator.
//!
//! The replicator never decides who is in the cluster. A membership subsystem
//! (heartbeats, elections, whatever the host uses) owns that and exposes it
//! through [`NodeRegistry`]. The engine reads one snapshot per operation and
//! treats it as advisory: a node reported `Connected` can still fail on the
//! wire, which is recorded as a transport failure, not a registry error.
//!
//! # Node States
//!
//! ```text
//! Starting ──→ Connected ──→ Disconnected
//!    ↑                            │
//!    └────────────────────────────┘
//! ```
//!
//! Only `Connected` nodes are dispatched to. `Starting` and `Disconnected`
//! nodes are resolved but recorded as skipped.
//!
//! [`StaticNodeRegistry`] is a ready-made registry backed by a concurrent map,
//! for hosts that push membership changes in and for tests.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection state of a node as last reported by membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeConnectionState {
    /// Joining the cluster; not yet eligible for replicated requests.
    Starting,
    /// Live member, receives replicated requests.
    Connected,
    /// Not reachable or removed by membership.
    Disconnected,
}

impl fmt::Display for NodeConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// A node as resolved for one operation.
///
/// This is a snapshot taken at dispatch time, not live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTarget {
    /// Stable node identity.
    pub id: NodeId,
    /// Base address of the node's API, e.g. `http://node-1:8443`.
    pub address: String,
    /// Membership state when the snapshot was taken.
    pub state: NodeConnectionState,
}

impl NodeTarget {
    /// Create a target.
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>, state: NodeConnectionState) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            state,
        }
    }

    /// Create a connected target.
    pub fn connected(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self::new(id, address, NodeConnectionState::Connected)
    }

    /// Whether this snapshot allows dispatching to the node.
    pub fn is_connected(&self) -> bool {
        self.state == NodeConnectionState::Connected
    }
}

/// Read-only view of cluster membership consumed by the engine.
///
/// Implementations must return promptly: `list_nodes` is called once at the
/// start of every replicated operation.
pub trait NodeRegistry: Send + Sync + 'static {
    /// Current membership snapshot.
    ///
    /// The returned order is the resolution order used for stable reporting
    /// (first failure, fallback representative).
    fn list_nodes(&self) -> Vec<NodeTarget>;

    /// Whether the node is currently connected.
    fn is_connected(&self, node_id: &NodeId) -> bool {
        self.list_nodes()
            .iter()
            .any(|n| &n.id == node_id && n.is_connected())
    }
}

/// Membership registry fed by the host.
///
/// Snapshots are returned sorted by node ID so resolution order is stable.
#[derive(Debug, Default)]
pub struct StaticNodeRegistry {
    nodes: DashMap<NodeId, NodeTarget>,
}

impl StaticNodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the given nodes.
    pub fn with_nodes(nodes: impl IntoIterator<Item = NodeTarget>) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.upsert(node);
        }
        registry
    }

    /// Add or replace a node.
    pub fn upsert(&self, node: NodeTarget) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Update a node's state. Returns `false` if the node is unknown.
    pub fn set_state(&self, node_id: &NodeId, state: NodeConnectionState) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(mut node) => {
                node.state = state;
                true
            }
            None => false,
        }
    }

    /// Remove a node.
    pub fn remove(&self, node_id: &NodeId) -> Option<NodeTarget> {
        self.nodes.remove(node_id).map(|(_, node)| node)
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no nodes are known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeRegistry for StaticNodeRegistry {
    fn list_nodes(&self) -> Vec<NodeTarget> {
        let mut nodes: Vec<NodeTarget> = self.nodes.iter().map(|r| r.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn is_connected(&self, node_id: &NodeId) -> bool {
        self.nodes
            .get(node_id)
            .map(|n| n.is_connected())
            .unwrap_or(false)
    }
}
