//! Primary-side result types and the scoped primary reference.

use super::action::ReplicationHandler;
use super::operation::Primary;
use super::response::{ReplicationResponse, ShardInfo};
use crate::cluster::ShardRouting;
use crate::error::{Error, Result};
use crate::shard::{IndexShard, IndexShardState, OperationPermit};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of the domain operation on the primary.
///
/// Exactly one of response or failure is set. The replica request is always
/// present: even a failed primary operation replicates it, so replicas keep
/// write-ahead-log parity with the primary.
#[derive(Debug)]
pub struct PrimaryResult<RepReq, Resp> {
    replica_request: RepReq,
    response: Option<Resp>,
    failure: Option<Error>,
}

impl<RepReq, Resp: ReplicationResponse> PrimaryResult<RepReq, Resp> {
    /// A successful primary operation.
    pub fn success(replica_request: RepReq, response: Resp) -> Self {
        Self {
            replica_request,
            response: Some(response),
            failure: None,
        }
    }

    /// A failed primary operation whose effects must still replicate.
    pub fn failure(replica_request: RepReq, failure: Error) -> Self {
        Self {
            replica_request,
            response: None,
            failure: Some(failure),
        }
    }

    /// The request to send to each replica copy.
    pub fn replica_request(&self) -> &RepReq {
        &self.replica_request
    }

    /// Attach the per-copy summary to the response, if there is one.
    pub fn set_shard_info(&mut self, shard_info: ShardInfo) {
        if let Some(response) = self.response.as_mut() {
            response.set_shard_info(shard_info);
        }
    }

    /// Resolve into the caller-visible outcome.
    pub fn into_response(self) -> Result<Resp> {
        match (self.response, self.failure) {
            (Some(response), None) => Ok(response),
            (None, Some(failure)) => Err(failure),
            _ => Err(Error::Internal(
                "primary result must carry either a response or a failure".to_string(),
            )),
        }
    }
}

/// Outcome of the domain operation on a replica.
#[derive(Debug, Default)]
pub struct ReplicaResult {
    failure: Option<Error>,
}

impl ReplicaResult {
    /// The operation applied cleanly.
    pub fn ok() -> Self {
        Self { failure: None }
    }

    /// The operation failed on this copy.
    pub fn failed(failure: Error) -> Self {
        Self {
            failure: Some(failure),
        }
    }

    /// Resolve into the RPC outcome.
    pub fn into_result(self) -> Result<()> {
        match self.failure {
            None => Ok(()),
            Some(failure) => Err(failure),
        }
    }
}

/// Scoped exclusive hold on the primary copy for one replicated operation.
///
/// Owns an operation permit for the shard; the permit is released exactly
/// once, on `close` or on drop, whichever comes first.
pub struct PrimaryShardReference<H: ReplicationHandler> {
    handler: Arc<H>,
    shard: Arc<IndexShard>,
    permit: Mutex<Option<OperationPermit>>,
}

impl<H: ReplicationHandler> PrimaryShardReference<H> {
    pub(crate) fn new(handler: Arc<H>, shard: Arc<IndexShard>, permit: OperationPermit) -> Self {
        Self {
            handler,
            shard,
            permit: Mutex::new(Some(permit)),
        }
    }

    /// Whether the shard has handed its primacy off to a relocation target.
    pub fn is_relocated(&self) -> bool {
        self.shard.state() == IndexShardState::Relocated
    }

    /// Release the operation permit.
    pub fn close(&self) {
        if let Some(mut permit) = self.permit.lock().take() {
            permit.close();
        }
    }
}

#[async_trait]
impl<H: ReplicationHandler> Primary<H::Request, PrimaryResult<H::ReplicaRequest, H::Response>>
    for PrimaryShardReference<H>
{
    fn routing_entry(&self) -> ShardRouting {
        self.shard.routing_entry()
    }

    fn fail_shard(&self, message: &str, cause: &Error) {
        self.shard.fail_shard(message, cause);
    }

    async fn perform(
        &self,
        request: H::Request,
    ) -> Result<PrimaryResult<H::ReplicaRequest, H::Response>> {
        self.handler.primary_op(request, &self.shard).await
    }
}
