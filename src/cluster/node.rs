//! Cluster node descriptors.

use crate::types::{NodeId, NodeVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A node known to the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
    /// Software version the node runs, also its wire protocol version.
    pub version: NodeVersion,
}

impl DiscoveryNode {
    /// Create a node descriptor running the current version.
    pub fn new(id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            version: NodeVersion::CURRENT,
        }
    }

    /// Set the node version.
    pub fn with_version(mut self, version: NodeVersion) -> Self {
        self.version = version;
        self
    }
}

/// The set of nodes in a cluster state, plus the identity of the local node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    local_node_id: NodeId,
    nodes: HashMap<NodeId, DiscoveryNode>,
}

impl DiscoveryNodes {
    /// Create an empty node set with the given local node id.
    pub fn new(local_node_id: NodeId) -> Self {
        Self {
            local_node_id,
            nodes: HashMap::new(),
        }
    }

    /// Add a node.
    pub fn with_node(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id, node);
        self
    }

    /// Id of the node this state was observed on.
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Rebind the local node id. Used when the same topology is published to
    /// several nodes' cluster services.
    pub fn for_local_node(mut self, local_node_id: NodeId) -> Self {
        self.local_node_id = local_node_id;
        self
    }

    /// Look up a node.
    pub fn get(&self, id: NodeId) -> Option<&DiscoveryNode> {
        self.nodes.get(&id)
    }

    /// Whether the node is part of the cluster.
    pub fn node_exists(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
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
