//! Request and response capabilities for replicated actions.
//!
//! Concrete actions bring their own request, replica-request, and response
//! payloads. Instead of a type hierarchy, the pipeline asks for a handful of
//! small capabilities plus serde, and mutates requests only through them.

use crate::types::{ActiveShardCount, ShardId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Access to the target shard id, filled in during request resolution.
pub trait HasShardId {
    /// The target shard, once resolved.
    fn shard_id(&self) -> Option<&ShardId>;
    /// Set the target shard.
    fn set_shard_id(&mut self, shard_id: ShardId);
}

/// Access to the primary term a request was issued under.
pub trait HasPrimaryTerm {
    /// The primary term; 0 means "unknown, revalidate under the lock".
    fn primary_term(&self) -> u64;
    /// Set the primary term.
    fn set_primary_term(&mut self, term: u64);
}

/// Access to the overall operation timeout.
pub trait HasTimeout {
    /// How long routing may retry before giving up.
    fn timeout(&self) -> Duration;
}

/// Access to the wait-for-active-shards gate.
pub trait HasWaitForActiveShards {
    /// The configured gate.
    fn wait_for_active_shards(&self) -> ActiveShardCount;
    /// Set the gate (resolution of the `Default` placeholder).
    fn set_wait_for_active_shards(&mut self, count: ActiveShardCount);
}

/// A request that can be driven through the replication pipeline.
pub trait ReplicationRequest:
    HasShardId
    + HasPrimaryTerm
    + HasTimeout
    + HasWaitForActiveShards
    + Clone
    + fmt::Debug
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// The index this request addresses.
    fn index(&self) -> &str;

    /// Watermark preventing reroute ping-pong: the cluster-state version the
    /// last forwarding decision was based on.
    fn routed_based_on_cluster_version(&self) -> u64;

    /// Raise the routing watermark. Never decreases along a retry chain.
    fn set_routed_based_on_cluster_version(&mut self, version: u64);

    /// Record one routing retry.
    fn on_retry(&mut self);

    /// Number of routing retries so far.
    fn retries(&self) -> u32;

    /// Short description for logs and error messages.
    fn description(&self) -> String {
        format!("request to [{}]", self.index())
    }
}

/// The routing-relevant fields every replicated request carries.
///
/// Concrete request types embed this and delegate the capability traits to
/// it, keeping their own payload fields alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMeta {
    /// Target shard, `None` until resolved from routing.
    pub shard_id: Option<ShardId>,
    /// Overall operation timeout.
    pub timeout: Duration,
    /// Wait-for-active-shards gate.
    pub wait_for_active_shards: ActiveShardCount,
    /// Primary term, carried for peers that expect it on the inner request.
    pub primary_term: u64,
    /// Routing watermark.
    pub routed_based_on_cluster_version: u64,
    /// Routing retry count.
    pub retries: u32,
}

impl ReplicationMeta {
    /// Meta with the default one-minute timeout.
    pub fn new() -> Self {
        Self {
            shard_id: None,
            timeout: Duration::from_secs(60),
            wait_for_active_shards: ActiveShardCount::Default,
            primary_term: 0,
            routed_based_on_cluster_version: 0,
            retries: 0,
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the wait-for-active-shards gate.
    pub fn with_wait_for_active_shards(mut self, count: ActiveShardCount) -> Self {
        self.wait_for_active_shards = count;
        self
    }

    /// Raise the routing watermark.
    pub fn raise_routing_watermark(&mut self, version: u64) {
        debug_assert!(
            version >= self.routed_based_on_cluster_version,
            "routing watermark must not decrease"
        );
        self.routed_based_on_cluster_version = version;
    }
}

impl Default for ReplicationMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_defaults() {
        let meta = ReplicationMeta::new();
        assert!(meta.shard_id.is_none());
        assert_eq!(meta.wait_for_active_shards, ActiveShardCount::Default);
        assert_eq!(meta.primary_term, 0);
        assert_eq!(meta.retries, 0);
    }

    #[test]
    fn test_watermark_raises() {
        let mut meta = ReplicationMeta::new();
        meta.raise_routing_watermark(4);
        meta.raise_routing_watermark(9);
        assert_eq!(meta.routed_based_on_cluster_version, 9);
    }
}
