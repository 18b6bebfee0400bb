//! Replica-side execution of a replicated request.

use super::action::{ReplicationAction, ReplicationHandler};
use super::request::{HasShardId, ReplicationRequest};
use crate::cluster::ObservedChange;
use crate::error::{Error, Result};
use crate::network::ConcreteShardRequest;
use crate::types::ReplicationTask;

/// Executes a replicated operation on a replica copy: validates the targeted
/// allocation id, takes the term-validated operation permit, and runs the
/// domain operation.
///
/// A `RetryOnReplica` failure (e.g. the replica's mappings lag the primary)
/// parks on the cluster-state observer and re-dispatches the same RPC to the
/// local node once a new state arrives. The observer has no timeout: failing
/// a replica is something to avoid at all costs.
pub(crate) struct ReplicaPhase<'a, H: ReplicationHandler> {
    action: &'a ReplicationAction<H>,
    request: H::ReplicaRequest,
    target_allocation_id: String,
    primary_term: u64,
    task: &'a ReplicationTask,
}

impl<'a, H: ReplicationHandler> ReplicaPhase<'a, H> {
    pub(crate) fn new(
        action: &'a ReplicationAction<H>,
        request: ConcreteShardRequest<H::ReplicaRequest>,
        task: &'a ReplicationTask,
    ) -> Self {
        debug_assert!(request.primary_term > 0, "primary term can't be zero");
        Self {
            action,
            request: request.request,
            target_allocation_id: request.target_allocation_id,
            primary_term: request.primary_term,
            task,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let shard_id = match self.request.shard_id().cloned() {
            Some(shard_id) => shard_id,
            None => {
                return Err(Error::Internal(
                    "replica request shard id must be set".to_string(),
                ))
            }
        };
        // subscribe before doing any work so a state change racing with the
        // operation still wakes the retry below
        let mut observer = self.action.cluster().observer(None);
        observer.observed_state();

        self.task.set_phase("replica");
        let replica = self.action.shards().shard(&shard_id)?;
        let routing = replica.routing_entry();
        let actual_allocation_id = routing.allocation_id_str().unwrap_or_default();
        if actual_allocation_id != self.target_allocation_id {
            return Err(Error::ShardNotFound {
                shard_id,
                reason: format!(
                    "expected allocation id [{}] but found [{}]",
                    self.target_allocation_id, actual_allocation_id
                ),
            });
        }

        let mut permit = replica
            .acquire_replica_operation_permit(self.primary_term)
            .await?;
        let outcome = self.action.handler().replica_op(&self.request, &replica).await;
        // release the permit before responding
        permit.close();

        match outcome {
            Ok(replica_result) => {
                self.task.set_phase("finished");
                replica_result.into_result()
            }
            Err(retry @ Error::RetryOnReplica { .. }) => {
                tracing::trace!(
                    %shard_id,
                    action = %self.action.config().replica_action_name(),
                    %retry,
                    "retrying operation on replica after cluster state change"
                );
                self.request.on_retry();
                match observer.wait_for_next_change().await {
                    ObservedChange::NewState(_) => {
                        // re-dispatch through the transport so it re-enters
                        // the replica endpoint like any other RPC
                        let concrete = ConcreteShardRequest::new(
                            self.request.clone(),
                            self.target_allocation_id.clone(),
                            self.primary_term,
                        );
                        let result = self
                            .action
                            .transport()
                            .send_to_replica(self.action.cluster().local_node_id(), concrete)
                            .await;
                        self.task.set_phase("finished");
                        result
                    }
                    ObservedChange::Closed => {
                        self.task.set_phase("finished");
                        Err(Error::NodeClosed(self.action.cluster().local_node_id()))
                    }
                    ObservedChange::Timeout => {
                        debug_assert!(false, "replica observer has no timeout");
                        Err(Error::Internal(
                            "unexpected timeout waiting for cluster state change".to_string(),
                        ))
                    }
                }
            }
            Err(failure) => {
                self.task.set_phase("finished");
                Err(failure)
            }
        }
    }
}
