//! Fan-out of one primary result to all replica copies.

use super::primary::PrimaryResult;
use super::request::{HasTimeout, HasWaitForActiveShards, ReplicationRequest};
use super::response::{ReplicationResponse, ShardFailure, ShardInfo};
use crate::cluster::{ClusterState, ShardRouting, ShardRoutingState, ShardRoutingTable};
use crate::error::{Error, Result};
use crate::types::{ActiveShardCount, ShardId};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

/// Capabilities of the primary copy during a replicated operation.
#[async_trait]
pub trait Primary<Req, PR>: Send + Sync {
    /// The primary's current routing entry.
    fn routing_entry(&self) -> ShardRouting;

    /// Fail the primary copy locally.
    fn fail_shard(&self, message: &str, cause: &Error);

    /// Run the domain operation on the primary.
    async fn perform(&self, request: Req) -> Result<PR>;
}

/// Outcome of reporting a failed or stale copy to the master.
#[derive(Debug)]
pub enum FailureReportOutcome {
    /// The master acknowledged the report.
    Acked,
    /// The master no longer considers us the primary of this shard.
    PrimaryDemoted(Error),
    /// The report could not be delivered; expected during shutdown.
    Ignored(Error),
}

/// Capabilities for reaching replica copies and reporting their failures.
#[async_trait]
pub trait Replicas<RepReq>: Send + Sync {
    /// Run the operation on one replica copy.
    async fn perform_on(&self, replica: &ShardRouting, request: RepReq) -> Result<()>;

    /// Ask the master to fail a replica copy that did not apply the
    /// operation.
    async fn fail_shard(
        &self,
        replica: &ShardRouting,
        message: &str,
        cause: &Error,
    ) -> FailureReportOutcome;

    /// Ask the master to mark an in-sync copy that is no longer assigned as
    /// stale.
    async fn mark_as_stale(&self, shard_id: &ShardId, allocation_id: &str)
        -> FailureReportOutcome;
}

/// Drives one operation through the primary and out to every replica copy.
///
/// The wait-for-active-shards gate runs first, against live cluster state;
/// the fan-out set is computed from a routing-table snapshot taken after the
/// primary operation succeeded. Replica RPCs run in parallel and may resolve
/// in any order; the aggregate [`ShardInfo`] gives each targeted copy
/// exactly one outcome.
pub struct ReplicationOperation<'a, Req, RepReq, Resp, P, R>
where
    Req: ReplicationRequest,
    RepReq: ReplicationRequest,
    Resp: ReplicationResponse,
    P: Primary<Req, PrimaryResult<RepReq, Resp>>,
    R: Replicas<RepReq>,
{
    request: Req,
    primary: &'a P,
    replicas: &'a R,
    cluster_state: &'a (dyn Fn() -> Arc<ClusterState> + Send + Sync),
    execute_on_replicas: bool,
    action: &'a str,
    _marker: PhantomData<(RepReq, Resp)>,
}

impl<'a, Req, RepReq, Resp, P, R> ReplicationOperation<'a, Req, RepReq, Resp, P, R>
where
    Req: ReplicationRequest,
    RepReq: ReplicationRequest,
    Resp: ReplicationResponse,
    P: Primary<Req, PrimaryResult<RepReq, Resp>>,
    R: Replicas<RepReq>,
{
    /// Set up an operation.
    pub fn new(
        request: Req,
        primary: &'a P,
        replicas: &'a R,
        cluster_state: &'a (dyn Fn() -> Arc<ClusterState> + Send + Sync),
        execute_on_replicas: bool,
        action: &'a str,
    ) -> Self {
        Self {
            request,
            primary,
            replicas,
            cluster_state,
            execute_on_replicas,
            action,
            _marker: PhantomData,
        }
    }

    /// Run the operation to completion.
    pub async fn execute(self) -> Result<PrimaryResult<RepReq, Resp>> {
        let primary_routing = self.primary.routing_entry();
        let shard_id = primary_routing.shard_id.clone();

        if let Some(message) = self.check_active_shard_count(&shard_id) {
            tracing::trace!(%shard_id, action = self.action, message, "not enough active copies, failing");
            return Err(Error::UnavailableShards {
                shard_id,
                message: format!(
                    "{} Timeout: [{:?}], request: [{}]",
                    message,
                    self.request.timeout(),
                    self.request.description()
                ),
            });
        }

        let mut result = self.primary.perform(self.request.clone()).await?;
        let replica_request = result.replica_request().clone();

        let mut total: u32 = 1;
        let mut successful: u32 = 1;
        let mut failures: Vec<ShardFailure> = Vec::new();

        if self.execute_on_replicas {
            // snapshot taken after the primary operation succeeded
            let state = (self.cluster_state)();
            let table = state
                .routing_table
                .shard_routing_table(&shard_id)
                .cloned()
                .unwrap_or_default();

            self.mark_unassigned_in_sync_copies_stale(&state, &shard_id, &table)
                .await?;

            let targets: Vec<ShardRouting> = table
                .shards
                .iter()
                .filter(|s| s.assigned() && (s.active() || s.state == ShardRoutingState::Initializing))
                .filter(|s| s.allocation_id_str() != primary_routing.allocation_id_str())
                .cloned()
                .collect();
            total += targets.len() as u32;

            let replicas = self.replicas;
            let mut pending: FuturesUnordered<_> = targets
                .into_iter()
                .map(|replica| {
                    let request = replica_request.clone();
                    async move {
                        let outcome = replicas.perform_on(&replica, request).await;
                        (replica, outcome)
                    }
                })
                .collect();

            while let Some((replica, outcome)) = pending.next().await {
                match outcome {
                    Ok(()) => successful += 1,
                    Err(cause) => {
                        tracing::trace!(
                            %shard_id,
                            replica = %replica,
                            action = self.action,
                            %cause,
                            "failure while performing operation on replica"
                        );
                        failures.push(ShardFailure {
                            shard_id: replica.shard_id.clone(),
                            node_id: replica.current_node_id,
                            allocation_id: replica.allocation_id_str().map(str::to_string),
                            cause: cause.clone(),
                            primary: false,
                        });
                        let message =
                            format!("failed to perform {} on replica {}", self.action, replica);
                        match self.replicas.fail_shard(&replica, &message, &cause).await {
                            FailureReportOutcome::Acked => {}
                            FailureReportOutcome::Ignored(report_failure) => {
                                tracing::trace!(
                                    %shard_id,
                                    %report_failure,
                                    "ignoring unsendable shard-failed report"
                                );
                            }
                            FailureReportOutcome::PrimaryDemoted(demotion) => {
                                return Err(self.on_primary_demoted(&shard_id, demotion));
                            }
                        }
                    }
                }
            }
        }

        result.set_shard_info(ShardInfo::new(total, successful, failures));
        Ok(result)
    }

    /// In-sync copies the routing table no longer lists are unreachable by
    /// replication; ask the master to mark them stale before fanning out.
    async fn mark_unassigned_in_sync_copies_stale(
        &self,
        state: &ClusterState,
        shard_id: &ShardId,
        table: &ShardRoutingTable,
    ) -> Result<()> {
        let Some(in_sync) = state
            .metadata
            .index(shard_id.index_name())
            .and_then(|meta| meta.in_sync_allocations(shard_id.id))
        else {
            return Ok(());
        };
        let assigned: HashSet<&str> = table
            .shards
            .iter()
            .filter_map(ShardRouting::allocation_id_str)
            .collect();
        for stale_id in in_sync.iter().filter(|id| !assigned.contains(id.as_str())) {
            tracing::debug!(%shard_id, allocation_id = %stale_id, "marking unassigned in-sync copy as stale");
            match self.replicas.mark_as_stale(shard_id, stale_id).await {
                FailureReportOutcome::Acked | FailureReportOutcome::Ignored(_) => {}
                FailureReportOutcome::PrimaryDemoted(demotion) => {
                    return Err(self.on_primary_demoted(shard_id, demotion));
                }
            }
        }
        Ok(())
    }

    fn on_primary_demoted(&self, shard_id: &ShardId, demotion: Error) -> Error {
        let message = format!(
            "primary shard {} was demoted while failing replica shard",
            shard_id
        );
        // we are no longer the primary: fail ourselves and start over
        self.primary.fail_shard(&message, &demotion);
        Error::RetryOnPrimary {
            shard_id: shard_id.clone(),
            reason: message,
        }
    }

    fn check_active_shard_count(&self, shard_id: &ShardId) -> Option<String> {
        let wait_for = self.request.wait_for_active_shards();
        if wait_for == ActiveShardCount::None {
            return None;
        }
        let state = (self.cluster_state)();
        match state.routing_table.shard_routing_table(shard_id) {
            Some(table) => {
                if wait_for.enough(table.active_shard_count(), table.size()) {
                    None
                } else {
                    Some(format!(
                        "not enough active copies to meet shard count of [{}] (have {}, needed [{}]).",
                        wait_for,
                        table.active_shard_count(),
                        wait_for,
                    ))
                }
            }
            None => Some(format!("no routing table found for {}", shard_id)),
        }
    }
}
