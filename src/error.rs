//! Error types for the replication subsystem.
//!
//! Errors double as wire payloads: a replica failure travels back to the
//! primary inside the response, and per-copy failures are embedded in
//! [`ShardInfo`](crate::replication::ShardInfo). Every variant is therefore
//! serializable and carries owned data.

use crate::types::{NodeId, ShardId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the replication subsystem.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The request's index does not exist in the observed cluster state.
    #[error("no such index [{0}]")]
    IndexNotFound(String),

    /// The request's index is closed; writes are rejected outright.
    #[error("index [{0}] is closed")]
    IndexClosed(String),

    /// The addressed shard copy does not exist on this node, or the caller
    /// aimed at a stale incarnation of it.
    #[error("shard {shard_id} not found: {reason}")]
    ShardNotFound { shard_id: ShardId, reason: String },

    /// Not enough active copies, or no active primary, to serve the request.
    #[error("unavailable shards {shard_id}: {message}")]
    UnavailableShards { shard_id: ShardId, message: String },

    /// The primary-side view was stale; route again against fresher state.
    #[error("retry on primary {shard_id}: {reason}")]
    RetryOnPrimary { shard_id: ShardId, reason: String },

    /// The replica cannot apply the operation yet; retry after the next
    /// cluster-state change.
    #[error("retry on replica {shard_id}: {reason}")]
    RetryOnReplica { shard_id: ShardId, reason: String },

    /// The master no longer considers the sender the primary of this shard.
    #[error("no longer primary for {shard_id}: {reason}")]
    NoLongerPrimary { shard_id: ShardId, reason: String },

    /// A cluster-level or index-level block rejected the request.
    #[error("blocked by: {description}")]
    ClusterBlocked { description: String, retryable: bool },

    /// The local node is shutting down.
    #[error("node [{0}] is closed")]
    NodeClosed(NodeId),

    /// Failed to connect to a remote node.
    #[error("failed to connect to node [{node}]: {reason}")]
    ConnectTransport { node: NodeId, reason: String },

    /// A routing entry points at a node absent from the cluster state.
    #[error("unknown node [{0}]")]
    NoNodeAvailable(NodeId),

    /// The shard exists but is in a state that cannot serve the operation.
    #[error("shard {shard_id} in illegal state: {reason}")]
    IllegalShardState { shard_id: ShardId, reason: String },

    /// The shard's engine has been closed.
    #[error("shard {shard_id} is closed")]
    ShardClosed { shard_id: ShardId },

    /// I/O error.
    #[error("io error: {0}")]
    Io(String),

    /// Wire serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invariant violation or other unexpected condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the target shard copy is (possibly
    /// temporarily) not available, as opposed to the operation itself being
    /// rejected.
    pub fn is_shard_not_available(&self) -> bool {
        matches!(
            self,
            Error::ShardNotFound { .. }
                | Error::IndexNotFound(_)
                | Error::IllegalShardState { .. }
                | Error::UnavailableShards { .. }
                | Error::ShardClosed { .. }
        )
    }

    /// Whether a primary-side failure should send the request back through
    /// routing rather than failing it.
    pub fn is_retry_primary(&self) -> bool {
        matches!(self, Error::RetryOnPrimary { .. }) || self.is_shard_not_available()
    }

    /// Whether a failed dispatch should be retried after the next observed
    /// cluster-state change. `primary_action` is true when the failed RPC was
    /// aimed at the primary endpoint (as opposed to a plain reroute hop).
    pub fn is_reroute_retryable(&self, primary_action: bool) -> bool {
        match self {
            Error::ConnectTransport { .. } | Error::NodeClosed(_) => true,
            other => primary_action && other.is_retry_primary(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
