//! Reporting failed or stale shard copies to the master.

use crate::error::{Error, Result};
use crate::types::ShardId;
use async_trait::async_trait;

/// Capability to tell the master that a shard copy must be failed or marked
/// stale.
///
/// The returned error distinguishes the cases the replication pipeline cares
/// about: `Err(Error::NoLongerPrimary { .. })` means the master no longer
/// considers the reporter the primary of the shard; transport and
/// node-closed errors are expected during shutdown and may be ignored.
#[async_trait]
pub trait ShardFailureReporter: Send + Sync + 'static {
    /// Ask the master to fail the copy identified by `allocation_id`.
    ///
    /// `cause` is `None` when the copy is merely being marked stale.
    async fn remote_shard_failed(
        &self,
        shard_id: &ShardId,
        allocation_id: &str,
        primary_term: u64,
        message: &str,
        cause: Option<Error>,
    ) -> Result<()>;
}

/// Reporter that acknowledges every report without doing anything.
#[derive(Debug, Default)]
pub struct NoopShardFailureReporter;

#[async_trait]
impl ShardFailureReporter for NoopShardFailureReporter {
    async fn remote_shard_failed(
        &self,
        shard_id: &ShardId,
        allocation_id: &str,
        _primary_term: u64,
        message: &str,
        _cause: Option<Error>,
    ) -> Result<()> {
        tracing::debug!(%shard_id, allocation_id, message, "dropping shard-failed report");
        Ok(())
    }
}
