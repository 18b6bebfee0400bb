//! Transport-backed replica access for the primary side.

use super::operation::{FailureReportOutcome, Replicas};
use super::request::ReplicationRequest;
use crate::cluster::{ClusterService, ShardFailureReporter, ShardRouting};
use crate::error::{Error, Result};
use crate::network::{ConcreteShardRequest, ReplicationTransport};
use crate::types::ShardId;
use async_trait::async_trait;
use std::sync::Arc;

/// Reaches replica copies over the transport and reports their failures to
/// the master, all under one primary term.
pub struct ReplicasProxy<Req, RepReq, Resp> {
    primary_term: u64,
    transport: Arc<dyn ReplicationTransport<Req, RepReq, Resp>>,
    cluster: Arc<ClusterService>,
    reporter: Arc<dyn ShardFailureReporter>,
}

impl<Req, RepReq, Resp> ReplicasProxy<Req, RepReq, Resp> {
    /// Create a proxy issuing RPCs under `primary_term`.
    pub fn new(
        primary_term: u64,
        transport: Arc<dyn ReplicationTransport<Req, RepReq, Resp>>,
        cluster: Arc<ClusterService>,
        reporter: Arc<dyn ShardFailureReporter>,
    ) -> Self {
        Self {
            primary_term,
            transport,
            cluster,
            reporter,
        }
    }

    async fn report(
        &self,
        shard_id: &ShardId,
        allocation_id: &str,
        message: &str,
        cause: Option<Error>,
    ) -> FailureReportOutcome {
        let result = self
            .reporter
            .remote_shard_failed(shard_id, allocation_id, self.primary_term, message, cause)
            .await;
        match result {
            Ok(()) => FailureReportOutcome::Acked,
            Err(demotion @ Error::NoLongerPrimary { .. }) => {
                FailureReportOutcome::PrimaryDemoted(demotion)
            }
            Err(failure) => {
                // transport and node-closed failures happen during shutdown;
                // anything else merits investigation
                if !matches!(
                    failure,
                    Error::ConnectTransport { .. } | Error::NodeClosed(_)
                ) {
                    tracing::warn!(%shard_id, allocation_id, %failure, "unexpected failure reporting failed shard");
                    debug_assert!(
                        false,
                        "unexpected shard-failed report error: {failure}"
                    );
                }
                FailureReportOutcome::Ignored(failure)
            }
        }
    }
}

#[async_trait]
impl<Req, RepReq, Resp> Replicas<RepReq> for ReplicasProxy<Req, RepReq, Resp>
where
    Req: Send + Sync + 'static,
    RepReq: ReplicationRequest,
    Resp: Send + Sync + 'static,
{
    async fn perform_on(&self, replica: &ShardRouting, request: RepReq) -> Result<()> {
        let node_id = replica.current_node_id.ok_or_else(|| {
            Error::Internal(format!("replica {} is not assigned to a node", replica))
        })?;
        if !self.cluster.state().nodes.node_exists(node_id) {
            return Err(Error::NoNodeAvailable(node_id));
        }
        let allocation_id = replica.allocation_id_str().ok_or_else(|| {
            Error::Internal(format!("replica {} has no allocation id", replica))
        })?;
        let concrete = ConcreteShardRequest::new(request, allocation_id, self.primary_term);
        self.transport.send_to_replica(node_id, concrete).await
    }

    async fn fail_shard(
        &self,
        replica: &ShardRouting,
        message: &str,
        cause: &Error,
    ) -> FailureReportOutcome {
        let allocation_id = replica.allocation_id_str().unwrap_or_default();
        self.report(
            &replica.shard_id,
            allocation_id,
            message,
            Some(cause.clone()),
        )
        .await
    }

    async fn mark_as_stale(
        &self,
        shard_id: &ShardId,
        allocation_id: &str,
    ) -> FailureReportOutcome {
        self.report(shard_id, allocation_id, "mark copy as stale", None)
            .await
    }
}
