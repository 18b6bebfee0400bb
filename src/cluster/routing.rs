//! Shard routing entries and routing tables.

use crate::types::{AllocationId, NodeId, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle state of one shard copy in the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRoutingState {
    /// Not allocated to any node.
    Unassigned,
    /// Allocated and recovering; receives replicated operations to stay
    /// caught up, but does not count as active.
    Initializing,
    /// Fully started.
    Started,
    /// Started and moving to another node; still serves and receives
    /// operations until the hand-off completes.
    Relocating,
}

impl fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// The cluster-state record describing where and in what state one shard
/// copy is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    /// The shard this copy belongs to.
    pub shard_id: ShardId,
    /// Node currently holding the copy; `None` while unassigned.
    pub current_node_id: Option<NodeId>,
    /// Node the copy is relocating to, if any.
    pub relocating_node_id: Option<NodeId>,
    /// Whether this copy is the primary.
    pub primary: bool,
    /// Lifecycle state.
    pub state: ShardRoutingState,
    /// Identity of this copy; `None` while unassigned.
    pub allocation_id: Option<AllocationId>,
}

impl ShardRouting {
    /// An unassigned copy.
    pub fn unassigned(shard_id: ShardId, primary: bool) -> Self {
        Self {
            shard_id,
            current_node_id: None,
            relocating_node_id: None,
            primary,
            state: ShardRoutingState::Unassigned,
            allocation_id: None,
        }
    }

    /// An initializing copy on a node, with a fresh allocation id.
    pub fn initializing(shard_id: ShardId, node: NodeId, primary: bool) -> Self {
        Self {
            shard_id,
            current_node_id: Some(node),
            relocating_node_id: None,
            primary,
            state: ShardRoutingState::Initializing,
            allocation_id: Some(AllocationId::new()),
        }
    }

    /// A started copy on a node, with a fresh allocation id.
    pub fn started(shard_id: ShardId, node: NodeId, primary: bool) -> Self {
        Self {
            shard_id,
            current_node_id: Some(node),
            relocating_node_id: None,
            primary,
            state: ShardRoutingState::Started,
            allocation_id: Some(AllocationId::new()),
        }
    }

    /// Replace the allocation id.
    pub fn with_allocation_id(mut self, allocation_id: AllocationId) -> Self {
        self.allocation_id = Some(allocation_id);
        self
    }

    /// Begin relocating this copy to `target`. The allocation id gains a
    /// relocation id naming the target copy.
    pub fn relocate_to(mut self, target: NodeId) -> Self {
        debug_assert_eq!(self.state, ShardRoutingState::Started);
        self.state = ShardRoutingState::Relocating;
        self.relocating_node_id = Some(target);
        self.allocation_id = self.allocation_id.map(|id| id.begin_relocation());
        self
    }

    /// The relocation-target twin of this relocating copy: an initializing
    /// entry on the target node whose allocation id is the relocation id.
    pub fn relocation_target(&self) -> Option<ShardRouting> {
        let target_node = self.relocating_node_id?;
        let relocation_id = self.allocation_id.as_ref()?.relocation_id.clone()?;
        Some(ShardRouting {
            shard_id: self.shard_id.clone(),
            current_node_id: Some(target_node),
            relocating_node_id: None,
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            allocation_id: Some(AllocationId::with_id(relocation_id)),
        })
    }

    /// Whether the copy is allocated to a node.
    pub fn assigned(&self) -> bool {
        self.current_node_id.is_some()
    }

    /// Whether the copy serves operations.
    pub fn active(&self) -> bool {
        matches!(
            self.state,
            ShardRoutingState::Started | ShardRoutingState::Relocating
        )
    }

    /// Whether the copy is relocating.
    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// The allocation id string, if assigned.
    pub fn allocation_id_str(&self) -> Option<&str> {
        self.allocation_id.as_ref().map(|a| a.id.as_str())
    }
}

impl fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}], node[{:?}], {}",
            self.shard_id,
            if self.primary { "P" } else { "R" },
            self.current_node_id,
            self.state
        )
    }
}

/// All copies of one shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardRoutingTable {
    /// The shard.
    pub shard_id: Option<ShardId>,
    /// Every copy, primary first by convention but not by requirement.
    pub shards: Vec<ShardRouting>,
}

impl ShardRoutingTable {
    /// Build a table from copies.
    pub fn new(shard_id: ShardId, shards: Vec<ShardRouting>) -> Self {
        Self {
            shard_id: Some(shard_id),
            shards,
        }
    }

    /// The primary copy, if present.
    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    /// Number of copies, assigned or not.
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// Number of active copies.
    pub fn active_shard_count(&self) -> usize {
        self.shards.iter().filter(|s| s.active()).count()
    }
}

/// Routing tables for every shard in the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    shards: HashMap<ShardId, ShardRoutingTable>,
}

impl RoutingTable {
    /// Empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard's table.
    pub fn with_shard_table(mut self, table: ShardRoutingTable) -> Self {
        if let Some(shard_id) = table.shard_id.clone() {
            self.shards.insert(shard_id, table);
        }
        self
    }

    /// Look up the table for a shard.
    pub fn shard_routing_table(&self, shard_id: &ShardId) -> Option<&ShardRoutingTable> {
        self.shards.get(shard_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexId;

    fn shard_id() -> ShardId {
        ShardId::new(IndexId::with_uuid("logs", "u"), 0)
    }

    #[test]
    fn test_active_states() {
        assert!(!ShardRouting::unassigned(shard_id(), true).active());
        assert!(!ShardRouting::initializing(shard_id(), 1, false).active());
        assert!(ShardRouting::started(shard_id(), 1, true).active());
        assert!(ShardRouting::started(shard_id(), 1, true)
            .relocate_to(2)
            .active());
    }

    #[test]
    fn test_relocation_target_identity() {
        let source = ShardRouting::started(shard_id(), 1, true).relocate_to(2);
        let target = source.relocation_target().unwrap();
        assert_eq!(target.current_node_id, Some(2));
        assert_eq!(target.state, ShardRoutingState::Initializing);
        assert!(target.primary);
        assert_eq!(
            target.allocation_id_str(),
            source
                .allocation_id
                .as_ref()
                .unwrap()
                .relocation_id
                .as_deref()
        );
    }

    #[test]
    fn test_table_primary_and_counts() {
        let primary = ShardRouting::started(shard_id(), 1, true);
        let replica = ShardRouting::started(shard_id(), 2, false);
        let initializing = ShardRouting::initializing(shard_id(), 3, false);
        let table = ShardRoutingTable::new(
            shard_id(),
            vec![primary.clone(), replica, initializing],
        );

        assert_eq!(table.size(), 3);
        assert_eq!(table.active_shard_count(), 2);
        assert_eq!(
            table.primary_shard().unwrap().allocation_id_str(),
            primary.allocation_id_str()
        );
    }

    #[test]
    fn test_routing_table_lookup() {
        let table = ShardRoutingTable::new(
            shard_id(),
            vec![ShardRouting::started(shard_id(), 1, true)],
        );
        let routing = RoutingTable::new().with_shard_table(table);
        assert!(routing.shard_routing_table(&shard_id()).is_some());

        let other = ShardId::new(IndexId::with_uuid("metrics", "m"), 0);
        assert!(routing.shard_routing_table(&other).is_none());
    }
}
