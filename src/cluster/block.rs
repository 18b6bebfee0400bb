//! Cluster-level and index-level blocks.
//!
//! A block is a read-only flag in the cluster state that rejects requests at
//! one or more levels. Retryable blocks describe transient conditions (e.g.
//! the state has not been recovered yet) and schedule a retry; non-retryable
//! blocks fail the request immediately.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The scope of operations a block applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockLevel {
    /// Read operations.
    Read,
    /// Write operations.
    Write,
    /// Metadata operations (mappings, settings).
    Metadata,
}

/// A single block entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterBlock {
    /// Stable identifier of the block.
    pub id: u32,
    /// Human-readable description for error messages.
    pub description: String,
    /// Whether the blocked condition may clear with a later cluster state.
    pub retryable: bool,
    /// Levels this block applies to.
    pub levels: Vec<BlockLevel>,
}

impl ClusterBlock {
    /// Create a block.
    pub fn new(id: u32, description: impl Into<String>, retryable: bool, levels: Vec<BlockLevel>) -> Self {
        Self {
            id,
            description: description.into(),
            retryable,
            levels,
        }
    }

    /// Whether the block applies at the given level.
    pub fn contains(&self, level: BlockLevel) -> bool {
        self.levels.contains(&level)
    }
}

/// All blocks active in a cluster state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterBlocks {
    global: Vec<ClusterBlock>,
    indices: HashMap<String, Vec<ClusterBlock>>,
}

impl ClusterBlocks {
    /// No blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a global block.
    pub fn with_global_block(mut self, block: ClusterBlock) -> Self {
        self.global.push(block);
        self
    }

    /// Add a block scoped to one index.
    pub fn with_index_block(mut self, index: impl Into<String>, block: ClusterBlock) -> Self {
        self.indices.entry(index.into()).or_default().push(block);
        self
    }

    /// The first global block at the given level, if any.
    pub fn global_blocked(&self, level: BlockLevel) -> Option<&ClusterBlock> {
        self.global.iter().find(|b| b.contains(level))
    }

    /// The first block on `index` at the given level, if any.
    pub fn index_blocked(&self, level: BlockLevel, index: &str) -> Option<&ClusterBlock> {
        self.indices
            .get(index)
            .and_then(|blocks| blocks.iter().find(|b| b.contains(level)))
    }

    /// Error for a global block at the given level.
    pub fn global_block_error(&self, level: BlockLevel) -> Option<Error> {
        self.global_blocked(level).map(block_error)
    }

    /// Error for an index block at the given level.
    pub fn index_block_error(&self, level: BlockLevel, index: &str) -> Option<Error> {
        self.index_blocked(level, index).map(block_error)
    }
}

fn block_error(block: &ClusterBlock) -> Error {
    Error::ClusterBlocked {
        description: format!("[{}/{}]", block.id, block.description),
        retryable: block.retryable,
    }
}
