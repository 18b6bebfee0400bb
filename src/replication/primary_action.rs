//! Primary-side execution of a replicated request.

use super::action::{ReplicationAction, ReplicationHandler};
use super::primary::PrimaryShardReference;
use super::proxy::ReplicasProxy;
use super::operation::{Primary, ReplicationOperation};
use super::request::HasShardId;
use crate::error::{Error, Result};
use crate::network::ConcreteShardRequest;
use crate::types::{NodeVersion, ReplicationTask, ShardId};

/// Executes a request on the node holding the primary copy: validates the
/// targeted identity, takes the operation permit, runs the domain operation,
/// and drives the replication fan-out.
///
/// A primary that already handed off to a relocation target releases the
/// permit immediately and delegates the whole phase to the target node.
pub(crate) struct PrimaryPhase<'a, H: ReplicationHandler> {
    action: &'a ReplicationAction<H>,
    request: H::Request,
    target_allocation_id: String,
    primary_term: u64,
    task: &'a ReplicationTask,
}

impl<'a, H: ReplicationHandler> PrimaryPhase<'a, H> {
    pub(crate) fn new(
        action: &'a ReplicationAction<H>,
        request: ConcreteShardRequest<H::Request>,
        task: &'a ReplicationTask,
    ) -> Self {
        Self {
            action,
            request: request.request,
            target_allocation_id: request.target_allocation_id,
            primary_term: request.primary_term,
            task,
        }
    }

    pub(crate) async fn run(self) -> Result<H::Response> {
        let shard_id = match self.request.shard_id().cloned() {
            Some(shard_id) => shard_id,
            None => {
                return Err(Error::Internal(
                    "primary request shard id must be set".to_string(),
                ))
            }
        };

        // a zero term comes from peers that route without term knowledge:
        // trust the current cluster-state term speculatively, it is still
        // validated against the shard's actual term below
        let primary_term = if self.primary_term > 0 {
            self.primary_term
        } else {
            let state = self.action.cluster().state();
            let meta = state
                .metadata
                .index(shard_id.index_name())
                .ok_or_else(|| Error::IndexNotFound(shard_id.index_name().to_string()))?;
            meta.primary_term(shard_id.id)
        };

        let reference = self.acquire_primary_reference(&shard_id, primary_term).await?;
        if reference.is_relocated() {
            return self
                .delegate_to_relocation_target(reference, &shard_id, primary_term)
                .await;
        }

        self.task.set_phase("primary");
        let state = self.action.cluster().state();
        let execute_on_replicas = state
            .metadata
            .index(shard_id.index_name())
            .map(|meta| self.action.handler().should_replicate(meta))
            .unwrap_or(true);

        let proxy = ReplicasProxy::new(
            primary_term,
            self.action.transport().clone(),
            self.action.cluster().clone(),
            self.action.reporter().clone(),
        );
        let cluster = self.action.cluster().clone();
        let state_supplier = move || cluster.state();
        let action_name = self.action.config().name.clone();

        let operation = ReplicationOperation::new(
            self.request.clone(),
            &reference,
            &proxy,
            &state_supplier,
            execute_on_replicas,
            &action_name,
        );
        let result = operation.execute().await;
        // release the permit before responding to the caller
        reference.close();
        self.task.set_phase("finished");
        result?.into_response()
    }

    /// Validate that the local shard is the copy this request was aimed at,
    /// then take its operation permit.
    async fn acquire_primary_reference(
        &self,
        shard_id: &ShardId,
        primary_term: u64,
    ) -> Result<PrimaryShardReference<H>> {
        let shard = self.action.shards().shard(shard_id)?;
        let routing = shard.routing_entry();

        // the routing state can be so stale that the local copy has been
        // replaced with a replica, e.g. after a failed primary was reassigned
        if !routing.primary {
            return Err(Error::RetryOnPrimary {
                shard_id: shard_id.clone(),
                reason: format!("actual shard is not a primary {}", routing),
            });
        }
        let actual_allocation_id = routing.allocation_id_str().unwrap_or_default();
        if actual_allocation_id != self.target_allocation_id {
            return Err(Error::ShardNotFound {
                shard_id: shard_id.clone(),
                reason: format!(
                    "expected allocation id [{}] but found [{}]",
                    self.target_allocation_id, actual_allocation_id
                ),
            });
        }
        let actual_term = shard.primary_term();
        if actual_term != primary_term {
            return Err(Error::ShardNotFound {
                shard_id: shard_id.clone(),
                reason: format!(
                    "expected allocation id [{}] with term [{}] but found [{}]",
                    self.target_allocation_id, primary_term, actual_term
                ),
            });
        }

        let permit = shard.acquire_primary_operation_permit().await?;
        Ok(PrimaryShardReference::new(
            self.action.handler().clone(),
            shard,
            permit,
        ))
    }

    /// The primary has handed off: mirror the whole primary phase to the
    /// relocation target, addressed by the relocation id.
    async fn delegate_to_relocation_target(
        &self,
        reference: PrimaryShardReference<H>,
        shard_id: &ShardId,
        primary_term: u64,
    ) -> Result<H::Response> {
        let routing = reference.routing_entry();
        // release the operation permit as soon as possible
        reference.close();
        self.task.set_phase("primary_delegation");
        debug_assert!(
            routing.relocating(),
            "shard is marked relocated but routing is not relocating: {}",
            routing
        );

        let target_node_id = routing.relocating_node_id.ok_or_else(|| {
            Error::Internal(format!("relocated shard {} has no relocation target", routing))
        })?;
        let state = self.action.cluster().state();
        let target_node = state.nodes.get(target_node_id).ok_or_else(|| {
            Error::ConnectTransport {
                node: target_node_id,
                reason: "relocation target node is not in the cluster state".to_string(),
            }
        })?;
        if target_node.version.major > NodeVersion::CURRENT.major {
            // a newer-major target requires a hand-off this version does not
            // speak; hold the request until the target activates
            return Err(Error::RetryOnPrimary {
                shard_id: shard_id.clone(),
                reason: format!(
                    "waiting for relocation target on node [{}] (version [{}]) to be activated",
                    target_node_id, target_node.version
                ),
            });
        }
        let relocation_id = routing
            .allocation_id
            .as_ref()
            .and_then(|id| id.relocation_id.clone())
            .ok_or_else(|| {
                Error::Internal(format!("relocating shard {} has no relocation id", routing))
            })?;

        tracing::trace!(
            %shard_id,
            target_node_id,
            relocation_id = %relocation_id,
            "delegating primary phase to relocation target"
        );
        let concrete =
            ConcreteShardRequest::new(self.request.clone(), relocation_id, primary_term);
        let response = self
            .action
            .transport()
            .send_to_primary(target_node_id, concrete)
            .await;
        self.task.set_phase("finished");
        response
    }
}
