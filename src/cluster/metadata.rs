//! Index metadata as carried by the cluster state.

use crate::types::{ActiveShardCount, IndexId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Whether an index accepts operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexState {
    /// Index is open and serving.
    Open,
    /// Index is closed; all shard-level operations are rejected.
    Close,
}

/// Per-index metadata: identity, state, and per-shard replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// The index identity.
    pub index: IndexId,
    /// Open/closed state.
    pub state: IndexState,
    /// Number of shards in the index.
    pub number_of_shards: u32,
    /// Primary term per shard number, bumped by the master on promotion.
    primary_terms: Vec<u64>,
    /// Allocation ids the master considers in sync, per shard number.
    in_sync_allocations: HashMap<u32, HashSet<String>>,
    /// Default wait-for-active-shards for requests that did not set one.
    pub wait_for_active_shards: ActiveShardCount,
    /// Whether replicas are backed by shared storage and skip replication.
    pub shadow_replicas: bool,
}

impl IndexMetadata {
    /// Create open-index metadata with all primary terms at 1.
    pub fn new(index: IndexId, number_of_shards: u32) -> Self {
        Self {
            index,
            state: IndexState::Open,
            number_of_shards,
            primary_terms: vec![1; number_of_shards as usize],
            in_sync_allocations: HashMap::new(),
            wait_for_active_shards: ActiveShardCount::One,
            shadow_replicas: false,
        }
    }

    /// Mark the index closed.
    pub fn closed(mut self) -> Self {
        self.state = IndexState::Close;
        self
    }

    /// Set the primary term of one shard.
    pub fn with_primary_term(mut self, shard: u32, term: u64) -> Self {
        self.primary_terms[shard as usize] = term;
        self
    }

    /// Record an in-sync allocation id for one shard.
    pub fn with_in_sync_allocation(mut self, shard: u32, allocation_id: impl Into<String>) -> Self {
        self.in_sync_allocations
            .entry(shard)
            .or_default()
            .insert(allocation_id.into());
        self
    }

    /// Set the default wait-for-active-shards.
    pub fn with_wait_for_active_shards(mut self, count: ActiveShardCount) -> Self {
        self.wait_for_active_shards = count;
        self
    }

    /// Mark replicas as shadow replicas.
    pub fn with_shadow_replicas(mut self) -> Self {
        self.shadow_replicas = true;
        self
    }

    /// The primary term of one shard.
    pub fn primary_term(&self, shard: u32) -> u64 {
        self.primary_terms.get(shard as usize).copied().unwrap_or(0)
    }

    /// The in-sync allocation ids of one shard.
    pub fn in_sync_allocations(&self, shard: u32) -> Option<&HashSet<String>> {
        self.in_sync_allocations.get(&shard)
    }
}

/// Cluster metadata: the set of indices.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    indices: HashMap<String, IndexMetadata>,
}

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an index.
    pub fn with_index(mut self, index: IndexMetadata) -> Self {
        self.indices.insert(index.index.name.clone(), index);
        self
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_terms() {
        let meta = IndexMetadata::new(IndexId::with_uuid("logs", "u"), 2)
            .with_primary_term(1, 7);
        assert_eq!(meta.primary_term(0), 1);
        assert_eq!(meta.primary_term(1), 7);
        assert_eq!(meta.primary_term(9), 0);
    }

    #[test]
    fn test_in_sync_allocations() {
        let meta = IndexMetadata::new(IndexId::with_uuid("logs", "u"), 1)
            .with_in_sync_allocation(0, "a1")
            .with_in_sync_allocation(0, "a2");
        let ids = meta.in_sync_allocations(0).unwrap();
        assert!(ids.contains("a1") && ids.contains("a2"));
        assert!(meta.in_sync_allocations(1).is_none());
    }

    #[test]
    fn test_metadata_lookup() {
        let metadata =
            Metadata::new().with_index(IndexMetadata::new(IndexId::with_uuid("logs", "u"), 1));
        assert!(metadata.index("logs").is_some());
        assert!(metadata.index("metrics").is_none());
    }
}
