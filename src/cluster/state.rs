//! Versioned, immutable cluster-state snapshots.

use super::block::ClusterBlocks;
use super::metadata::Metadata;
use super::node::DiscoveryNodes;
use super::routing::RoutingTable;
use std::fmt;

/// One immutable snapshot of cluster topology and metadata.
///
/// States are shared as `Arc<ClusterState>`; a new state replaces the old
/// one wholesale, it is never mutated in place. `version` increases with
/// every published state.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    /// Monotonically increasing state version.
    pub version: u64,
    /// Known nodes.
    pub nodes: DiscoveryNodes,
    /// Index metadata.
    pub metadata: Metadata,
    /// Shard routing.
    pub routing_table: RoutingTable,
    /// Active blocks.
    pub blocks: ClusterBlocks,
}

impl ClusterState {
    /// Start building a state at the given version.
    pub fn builder(version: u64) -> ClusterStateBuilder {
        ClusterStateBuilder {
            state: ClusterState {
                version,
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster state [version={}, nodes={}]",
            self.version,
            self.nodes.len()
        )
    }
}

/// Builder for [`ClusterState`].
#[derive(Debug)]
pub struct ClusterStateBuilder {
    state: ClusterState,
}

impl ClusterStateBuilder {
    /// Set the node set.
    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.state.nodes = nodes;
        self
    }

    /// Set the metadata.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.state.metadata = metadata;
        self
    }

    /// Set the routing table.
    pub fn routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.state.routing_table = routing_table;
        self
    }

    /// Set the blocks.
    pub fn blocks(mut self, blocks: ClusterBlocks) -> Self {
        self.state.blocks = blocks;
        self
    }

    /// Finish building.
    pub fn build(self) -> ClusterState {
        self.state
    }
}
