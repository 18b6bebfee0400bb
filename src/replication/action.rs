//! The replication action: handler seam, wiring, and the three endpoints.

use super::primary::{PrimaryResult, ReplicaResult};
use super::primary_action::PrimaryPhase;
use super::replica_action::ReplicaPhase;
use super::reroute::ReroutePhase;
use super::request::{HasWaitForActiveShards, ReplicationRequest};
use super::response::ReplicationResponse;
use crate::cluster::{BlockLevel, ClusterService, ClusterState, IndexMetadata, ShardFailureReporter};
use crate::config::ActionConfig;
use crate::error::Result;
use crate::network::{ConcreteShardRequest, ReplicationTransport};
use crate::shard::{IndexShard, IndexShardRegistry};
use crate::types::{ActiveShardCount, ReplicationTask};
use async_trait::async_trait;
use std::sync::Arc;

/// The domain side of a replicated action.
///
/// The pipeline owns routing, locking, fan-out, and retries; the handler
/// supplies what the operation actually does on the primary and on each
/// replica, and how a raw request resolves to a concrete shard.
#[async_trait]
pub trait ReplicationHandler: Send + Sync + Sized + 'static {
    /// Request accepted from callers.
    type Request: ReplicationRequest;
    /// Request replicated to each replica copy.
    type ReplicaRequest: ReplicationRequest;
    /// Response returned to callers.
    type Response: ReplicationResponse;

    /// Fill in derived request fields: the target shard id, and the
    /// wait-for-active-shards gate when the request left it at `Default`.
    fn resolve_request(
        &self,
        state: &ClusterState,
        index: &IndexMetadata,
        request: &mut Self::Request,
    ) -> Result<()>;

    /// Run the operation on the primary, under its operation permit.
    async fn primary_op(
        &self,
        request: Self::Request,
        primary: &IndexShard,
    ) -> Result<PrimaryResult<Self::ReplicaRequest, Self::Response>>;

    /// Run the operation on a replica, under its operation permit.
    async fn replica_op(
        &self,
        request: &Self::ReplicaRequest,
        replica: &IndexShard,
    ) -> Result<ReplicaResult>;

    /// Cluster-level block to check before execution, if any.
    fn global_block_level(&self) -> Option<BlockLevel> {
        None
    }

    /// Index-level block to check before execution, if any.
    fn index_block_level(&self) -> Option<BlockLevel> {
        None
    }

    /// Whether operations on this index replicate to its replicas. Shadow
    /// replicas share storage with the primary and skip replication.
    fn should_replicate(&self, index: &IndexMetadata) -> bool {
        !index.shadow_replicas
    }

    /// Resolve the `Default` wait-for-active-shards placeholder from index
    /// settings. Handlers call this from `resolve_request`.
    fn resolve_wait_for_active_shards(index: &IndexMetadata, request: &mut Self::Request) {
        if request.wait_for_active_shards() == ActiveShardCount::Default {
            request.set_wait_for_active_shards(index.wait_for_active_shards);
        }
    }
}

/// One replicated action: routing, primary acquisition, fan-out, and the
/// retry loop, wired to a handler and a transport.
///
/// The three server-side entry points correspond to the action's RPC
/// endpoints: `handle_request` for `<action>`, `handle_primary_request` for
/// `<action>[p]`, and `handle_replica_request` for `<action>[r]`.
pub struct ReplicationAction<H: ReplicationHandler> {
    config: ActionConfig,
    handler: Arc<H>,
    cluster: Arc<ClusterService>,
    shards: Arc<IndexShardRegistry>,
    transport: Arc<dyn ReplicationTransport<H::Request, H::ReplicaRequest, H::Response>>,
    reporter: Arc<dyn ShardFailureReporter>,
}

impl<H: ReplicationHandler> ReplicationAction<H> {
    /// Wire up an action.
    pub fn new(
        config: ActionConfig,
        handler: Arc<H>,
        cluster: Arc<ClusterService>,
        shards: Arc<IndexShardRegistry>,
        transport: Arc<dyn ReplicationTransport<H::Request, H::ReplicaRequest, H::Response>>,
        reporter: Arc<dyn ShardFailureReporter>,
    ) -> Self {
        Self {
            config,
            handler,
            cluster,
            shards,
            transport,
            reporter,
        }
    }

    /// The action configuration.
    pub fn config(&self) -> &ActionConfig {
        &self.config
    }

    /// Execute a request from this node, driving it to completion.
    pub async fn execute(&self, request: H::Request) -> Result<H::Response> {
        self.execute_with_task(request, &ReplicationTask::new()).await
    }

    /// Execute a request, reporting phase transitions on `task`.
    pub async fn execute_with_task(
        &self,
        request: H::Request,
        task: &ReplicationTask,
    ) -> Result<H::Response> {
        ReroutePhase::new(self, request, task).run().await
    }

    /// Entry point of the `<action>` endpoint: a raw request forwarded from
    /// another node re-enters routing here.
    pub async fn handle_request(&self, request: H::Request) -> Result<H::Response> {
        self.execute(request).await
    }

    /// Entry point of the `<action>[p]` endpoint.
    pub async fn handle_primary_request(
        &self,
        request: ConcreteShardRequest<H::Request>,
    ) -> Result<H::Response> {
        let task = ReplicationTask::new();
        self.handle_primary_request_with_task(request, &task).await
    }

    /// Primary endpoint with phase reporting.
    pub async fn handle_primary_request_with_task(
        &self,
        request: ConcreteShardRequest<H::Request>,
        task: &ReplicationTask,
    ) -> Result<H::Response> {
        PrimaryPhase::new(self, request, task).run().await
    }

    /// Entry point of the `<action>[r]` endpoint.
    pub async fn handle_replica_request(
        &self,
        request: ConcreteShardRequest<H::ReplicaRequest>,
    ) -> Result<()> {
        let task = ReplicationTask::new();
        self.handle_replica_request_with_task(request, &task).await
    }

    /// Replica endpoint with phase reporting.
    pub async fn handle_replica_request_with_task(
        &self,
        request: ConcreteShardRequest<H::ReplicaRequest>,
        task: &ReplicationTask,
    ) -> Result<()> {
        ReplicaPhase::new(self, request, task).run().await
    }

    pub(crate) fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub(crate) fn cluster(&self) -> &Arc<ClusterService> {
        &self.cluster
    }

    pub(crate) fn shards(&self) -> &Arc<IndexShardRegistry> {
        &self.shards
    }

    pub(crate) fn transport(
        &self,
    ) -> &Arc<dyn ReplicationTransport<H::Request, H::ReplicaRequest, H::Response>> {
        &self.transport
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn ShardFailureReporter> {
        &self.reporter
    }
}
