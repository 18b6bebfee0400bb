//! Node-local lookup of shard handles.

use super::index_shard::IndexShard;
use crate::error::{Error, Result};
use crate::types::ShardId;
use dashmap::DashMap;
use std::sync::Arc;

/// The shards hosted on this node.
#[derive(Debug, Default)]
pub struct IndexShardRegistry {
    shards: DashMap<ShardId, Arc<IndexShard>>,
}

impl IndexShardRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shard. Replaces any previous handle for the same id.
    pub fn register(&self, shard: Arc<IndexShard>) {
        self.shards.insert(shard.shard_id().clone(), shard);
    }

    /// Remove a shard.
    pub fn remove(&self, shard_id: &ShardId) -> Option<Arc<IndexShard>> {
        self.shards.remove(shard_id).map(|(_, shard)| shard)
    }

    /// Look up a shard, failing if this node does not host it.
    pub fn shard(&self, shard_id: &ShardId) -> Result<Arc<IndexShard>> {
        self.shards
            .get(shard_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ShardNotFound {
                shard_id: shard_id.clone(),
                reason: "shard is not hosted on this node".to_string(),
            })
    }

    /// Number of hosted shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether no shards are hosted.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ShardRouting;
    use crate::shard::IndexShardState;
    use crate::types::IndexId;

    #[test]
    fn test_register_and_lookup() {
        let registry = IndexShardRegistry::new();
        let shard_id = ShardId::new(IndexId::with_uuid("logs", "u"), 0);
        let routing = ShardRouting::started(shard_id.clone(), 1, true);
        registry.register(Arc::new(IndexShard::new(
            routing,
            IndexShardState::Started,
            1,
        )));

        assert!(registry.shard(&shard_id).is_ok());

        let missing = ShardId::new(IndexId::with_uuid("logs", "u"), 1);
        assert!(matches!(
            registry.shard(&missing),
            Err(Error::ShardNotFound { .. })
        ));
    }
}
