//! Aggregate replication outcomes returned to callers.

use crate::error::Error;
use crate::types::{NodeId, ShardId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A response produced by a replicated action.
pub trait ReplicationResponse:
    fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Attach the per-copy outcome summary.
    fn set_shard_info(&mut self, shard_info: ShardInfo);

    /// The per-copy outcome summary.
    fn shard_info(&self) -> &ShardInfo;
}

/// Failure of one shard copy during a replicated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFailure {
    /// The shard whose copy failed.
    pub shard_id: ShardId,
    /// Node that hosted the failing copy, if it was assigned.
    pub node_id: Option<NodeId>,
    /// Allocation id of the failing copy, if it was assigned.
    pub allocation_id: Option<String>,
    /// What went wrong.
    pub cause: Error,
    /// Whether the failing copy was the primary.
    pub primary: bool,
}

/// Per-copy outcome summary of one replicated operation.
///
/// Every targeted copy appears in exactly one bucket: `successful` counts
/// the primary plus each replica that applied the operation, and `failures`
/// lists each replica that did not. `total == successful + failures.len()`
/// always holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Copies the operation targeted, including the primary.
    pub total: u32,
    /// Copies that applied the operation, including the primary.
    pub successful: u32,
    /// One entry per replica copy that failed.
    pub failures: Vec<ShardFailure>,
}

impl ShardInfo {
    /// Build a summary.
    pub fn new(total: u32, successful: u32, failures: Vec<ShardFailure>) -> Self {
        debug_assert_eq!(
            total,
            successful + failures.len() as u32,
            "every targeted copy must have exactly one outcome"
        );
        Self {
            total,
            successful,
            failures,
        }
    }

    /// Number of failed copies.
    pub fn failed(&self) -> u32 {
        self.failures.len() as u32
    }
}

impl fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ShardInfo{{total={}, successful={}, failed={}}}",
            self.total,
            self.successful,
            self.failed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexId;

    #[test]
    fn test_shard_info_counts() {
        let shard_id = ShardId::new(IndexId::with_uuid("logs", "u"), 0);
        let failure = ShardFailure {
            shard_id,
            node_id: Some(2),
            allocation_id: Some("a2".into()),
            cause: Error::Internal("boom".into()),
            primary: false,
        };
        let info = ShardInfo::new(3, 2, vec![failure]);
        assert_eq!(info.failed(), 1);
        assert_eq!(info.to_string(), "ShardInfo{total=3, successful=2, failed=1}");
    }

    #[test]
    fn test_shard_info_round_trip() {
        let info = ShardInfo::new(2, 2, Vec::new());
        let bytes = bincode::serialize(&info).unwrap();
        let decoded: ShardInfo = bincode::deserialize(&bytes).unwrap();
        assert_eq!(info, decoded);
    }
}
