//! Top-level routing and retry for a replicated request.

use super::action::{ReplicationAction, ReplicationHandler};
use super::request::{
    HasPrimaryTerm, HasShardId, HasTimeout, HasWaitForActiveShards, ReplicationRequest,
};
use crate::cluster::{ClusterState, ClusterStateObserver, IndexState, ObservedChange, ShardRouting};
use crate::error::{Error, Result};
use crate::network::ConcreteShardRequest;
use crate::types::{ActiveShardCount, CompletionLatch, NodeId, ReplicationTask, ShardId};

/// One attempt either finishes the request or asks for a retry after the
/// next observed cluster-state change.
enum Attempt<T> {
    Finished(Result<T>),
    Retry(Error),
}

/// Resolves a request against observed cluster state, dispatches it to the
/// node with the primary copy, and retries on transient failures.
///
/// Retries are never immediate re-executions: the phase parks on the
/// cluster-state observer and re-runs when a new state arrives. When the
/// observer's timeout elapses, one final attempt runs; a failure after that
/// is terminal.
pub(crate) struct ReroutePhase<'a, H: ReplicationHandler> {
    action: &'a ReplicationAction<H>,
    request: H::Request,
    task: &'a ReplicationTask,
    observer: ClusterStateObserver,
    finished: CompletionLatch,
}

impl<'a, H: ReplicationHandler> ReroutePhase<'a, H> {
    pub(crate) fn new(
        action: &'a ReplicationAction<H>,
        request: H::Request,
        task: &'a ReplicationTask,
    ) -> Self {
        let observer = action.cluster().observer(Some(request.timeout()));
        Self {
            action,
            request,
            task,
            observer,
            finished: CompletionLatch::new(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<H::Response> {
        loop {
            match self.attempt().await {
                Attempt::Finished(result) => return result,
                Attempt::Retry(failure) => {
                    if let Err(terminal) = self.wait_for_retry(failure).await {
                        return self.finish_as_failed(terminal);
                    }
                }
            }
        }
    }

    async fn attempt(&mut self) -> Attempt<H::Response> {
        self.task.set_phase("routing");
        let state = self.observer.observed_state();

        if let Some(block) = self.block_error(&state) {
            let retryable = matches!(block, Error::ClusterBlocked { retryable: true, .. });
            return if retryable {
                tracing::trace!(%block, "cluster is blocked, scheduling a retry");
                Attempt::Retry(block)
            } else {
                Attempt::Finished(self.finish_as_failed(block))
            };
        }

        let concrete_index = self.request.index().to_string();
        let index_meta = match state.metadata.index(&concrete_index) {
            Some(meta) => meta,
            None => return Attempt::Retry(Error::IndexNotFound(concrete_index)),
        };
        if index_meta.state == IndexState::Close {
            return Attempt::Finished(self.finish_as_failed(Error::IndexClosed(concrete_index)));
        }

        if let Err(e) = self
            .action
            .handler()
            .resolve_request(&state, index_meta, &mut self.request)
        {
            return Attempt::Finished(self.finish_with_unexpected_failure(e));
        }
        debug_assert!(
            self.request.wait_for_active_shards() != ActiveShardCount::Default,
            "request wait_for_active_shards must be set in resolve_request"
        );
        let shard_id = match self.request.shard_id().cloned() {
            Some(shard_id) => shard_id,
            None => {
                return Attempt::Finished(self.finish_with_unexpected_failure(Error::Internal(
                    "request shard id must be set in resolve_request".to_string(),
                )))
            }
        };

        let primary = state
            .routing_table
            .shard_routing_table(&shard_id)
            .and_then(|table| table.primary_shard())
            .cloned();
        let primary = match primary {
            Some(primary) if primary.active() => primary,
            _ => {
                tracing::trace!(
                    %shard_id,
                    version = state.version,
                    "primary shard is not yet active, scheduling a retry"
                );
                return Attempt::Retry(self.unavailable(&shard_id, "primary shard is not active"));
            }
        };
        let node_id = match primary.current_node_id {
            Some(node_id) => node_id,
            None => {
                return Attempt::Retry(self.unavailable(&shard_id, "primary shard is not active"))
            }
        };
        if !state.nodes.node_exists(node_id) {
            tracing::trace!(
                %shard_id,
                node_id,
                version = state.version,
                "primary shard is assigned to an unknown node, scheduling a retry"
            );
            return Attempt::Retry(
                self.unavailable(&shard_id, "primary shard isn't assigned to a known node"),
            );
        }

        let local = node_id == self.action.cluster().local_node_id();
        if !local && state.version < self.request.routed_based_on_cluster_version() {
            tracing::trace!(
                %shard_id,
                local_version = state.version,
                sender_version = self.request.routed_based_on_cluster_version(),
                "local cluster state is older than on the sending node, scheduling a retry"
            );
            return Attempt::Retry(self.unavailable(
                &shard_id,
                &format!(
                    "failed to find primary as current cluster state with version [{}] is stale (expected at least [{}])",
                    state.version,
                    self.request.routed_based_on_cluster_version()
                ),
            ));
        }

        let primary_term = index_meta.primary_term(shard_id.id);
        let result = if local {
            self.perform_local(&state, &primary, primary_term).await
        } else {
            self.perform_remote(&state, node_id).await
        };

        match result {
            Ok(response) => Attempt::Finished(self.finish_on_success(response)),
            Err(failure) if failure.is_reroute_retryable(local) => {
                tracing::trace!(
                    %shard_id,
                    node_id,
                    %failure,
                    "received a retryable error from the primary node, scheduling a retry"
                );
                Attempt::Retry(failure)
            }
            Err(failure) => Attempt::Finished(self.finish_as_failed(failure)),
        }
    }

    async fn perform_local(
        &mut self,
        state: &ClusterState,
        primary: &ShardRouting,
        primary_term: u64,
    ) -> Result<H::Response> {
        self.task.set_phase("waiting_on_primary");
        let target_allocation_id = primary.allocation_id_str().unwrap_or_default().to_string();
        tracing::trace!(
            shard_id = %primary.shard_id,
            version = state.version,
            primary_term,
            "sending request to local primary"
        );
        let concrete =
            ConcreteShardRequest::new(self.request.clone(), target_allocation_id, primary_term);
        self.action
            .transport()
            .send_to_primary(self.action.cluster().local_node_id(), concrete)
            .await
    }

    async fn perform_remote(&mut self, state: &ClusterState, node_id: NodeId) -> Result<H::Response> {
        // chasing the primary for a second hop requires being at least as
        // fresh as this state, else two nodes can bounce a relocated primary
        // between each other forever
        self.request.set_routed_based_on_cluster_version(state.version);
        self.task.set_phase("rerouted");
        tracing::trace!(
            node_id,
            version = state.version,
            "rerouting request to remote primary node"
        );
        self.action
            .transport()
            .send_request(node_id, self.request.clone())
            .await
    }

    async fn wait_for_retry(&mut self, failure: Error) -> Result<()> {
        if self.observer.is_timed_out() {
            // running the last attempt after the timeout already fired
            return Err(failure);
        }
        self.task.set_phase("waiting_for_retry");
        self.request.on_retry();
        // the term will be re-resolved from whatever state routes the retry
        self.request.set_primary_term(0);
        match self.observer.wait_for_next_change().await {
            ObservedChange::NewState(_) => Ok(()),
            // try one more time against the latest state
            ObservedChange::Timeout => Ok(()),
            ObservedChange::Closed => Err(Error::NodeClosed(self.action.cluster().local_node_id())),
        }
    }

    fn block_error(&self, state: &ClusterState) -> Option<Error> {
        if let Some(level) = self.action.handler().global_block_level() {
            if let Some(error) = state.blocks.global_block_error(level) {
                return Some(error);
            }
        }
        if let Some(level) = self.action.handler().index_block_level() {
            if let Some(error) = state.blocks.index_block_error(level, self.request.index()) {
                return Some(error);
            }
        }
        None
    }

    fn unavailable(&self, shard_id: &ShardId, message: &str) -> Error {
        Error::UnavailableShards {
            shard_id: shard_id.clone(),
            message: format!(
                "{} Timeout: [{:?}], request: [{}]",
                message,
                self.request.timeout(),
                self.request.description()
            ),
        }
    }

    fn finish_on_success(&self, response: H::Response) -> Result<H::Response> {
        if self.finished.complete("finish_on_success") {
            self.task.set_phase("finished");
            tracing::trace!(
                action = %self.action.config().name,
                "replication request succeeded"
            );
        }
        Ok(response)
    }

    fn finish_as_failed(&self, failure: Error) -> Result<H::Response> {
        if self.finished.complete("finish_as_failed") {
            self.task.set_phase("failed");
            tracing::trace!(
                action = %self.action.config().name,
                %failure,
                "replication request failed"
            );
        }
        Err(failure)
    }

    fn finish_with_unexpected_failure(&self, failure: Error) -> Result<H::Response> {
        tracing::warn!(
            action = %self.action.config().name,
            %failure,
            "unexpected error during the primary phase"
        );
        if self.finished.complete("finish_with_unexpected_failure") {
            self.task.set_phase("failed");
        }
        Err(failure)
    }
}
