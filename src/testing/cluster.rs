//! In-process cluster harness for replication tests.
//!
//! Wires several nodes' actions together over a loopback transport with
//! partition injection, so full routing → primary → replica cycles run in
//! one process without sockets.

use crate::cluster::{
    BlockLevel, ClusterService, ClusterState, IndexMetadata, ShardFailureReporter,
};
use crate::config::ActionConfig;
use crate::error::{Error, Result};
use crate::network::{ConcreteShardRequest, ReplicationTransport};
use crate::replication::{
    HasPrimaryTerm, HasShardId, HasTimeout, HasWaitForActiveShards, PrimaryResult,
    ReplicaResult, ReplicationAction, ReplicationHandler, ReplicationMeta, ReplicationRequest,
    ReplicationResponse, ShardInfo,
};
use crate::shard::{IndexShard, IndexShardRegistry, IndexShardState};
use crate::types::{ActiveShardCount, NodeId, ShardId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// How a [`RecordingFailureReporter`] answers reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportBehavior {
    /// Acknowledge every report.
    Ack,
    /// Answer every report with "you are no longer the primary".
    DemotePrimary,
    /// Fail every report as if the master were unreachable.
    Unreachable,
}

/// One report delivered to the reporter.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub shard_id: ShardId,
    pub allocation_id: String,
    pub primary_term: u64,
    pub message: String,
    pub cause: Option<Error>,
}

/// Shard-failure reporter that records reports and answers per a
/// configurable behavior.
#[derive(Debug)]
pub struct RecordingFailureReporter {
    behavior: RwLock<ReportBehavior>,
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingFailureReporter {
    /// A reporter that acknowledges everything.
    pub fn new() -> Self {
        Self {
            behavior: RwLock::new(ReportBehavior::Ack),
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Change how subsequent reports are answered.
    pub fn set_behavior(&self, behavior: ReportBehavior) {
        *self.behavior.write() = behavior;
    }

    /// All reports received so far.
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().clone()
    }
}

impl Default for RecordingFailureReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardFailureReporter for RecordingFailureReporter {
    async fn remote_shard_failed(
        &self,
        shard_id: &ShardId,
        allocation_id: &str,
        primary_term: u64,
        message: &str,
        cause: Option<Error>,
    ) -> Result<()> {
        self.reports.lock().push(FailureReport {
            shard_id: shard_id.clone(),
            allocation_id: allocation_id.to_string(),
            primary_term,
            message: message.to_string(),
            cause,
        });
        match *self.behavior.read() {
            ReportBehavior::Ack => Ok(()),
            ReportBehavior::DemotePrimary => Err(Error::NoLongerPrimary {
                shard_id: shard_id.clone(),
                reason: "master reassigned the primary".to_string(),
            }),
            ReportBehavior::Unreachable => Err(Error::ConnectTransport {
                node: 0,
                reason: "master unreachable".to_string(),
            }),
        }
    }
}

/// A write request for exercising the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestWriteRequest {
    /// Routing fields.
    pub meta: ReplicationMeta,
    /// Target index name.
    pub index: String,
    /// Target shard number within the index.
    pub shard: u32,
    /// Payload stand-in.
    pub document: String,
}

impl TestWriteRequest {
    /// A request for shard 0 of `index`.
    pub fn new(index: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            meta: ReplicationMeta::new(),
            index: index.into(),
            shard: 0,
            document: document.into(),
        }
    }

    /// Set the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.meta.timeout = timeout;
        self
    }
}

impl HasShardId for TestWriteRequest {
    fn shard_id(&self) -> Option<&ShardId> {
        self.meta.shard_id.as_ref()
    }
    fn set_shard_id(&mut self, shard_id: ShardId) {
        self.meta.shard_id = Some(shard_id);
    }
}

impl HasPrimaryTerm for TestWriteRequest {
    fn primary_term(&self) -> u64 {
        self.meta.primary_term
    }
    fn set_primary_term(&mut self, term: u64) {
        self.meta.primary_term = term;
    }
}

impl HasTimeout for TestWriteRequest {
    fn timeout(&self) -> Duration {
        self.meta.timeout
    }
}

impl HasWaitForActiveShards for TestWriteRequest {
    fn wait_for_active_shards(&self) -> ActiveShardCount {
        self.meta.wait_for_active_shards
    }
    fn set_wait_for_active_shards(&mut self, count: ActiveShardCount) {
        self.meta.wait_for_active_shards = count;
    }
}

impl ReplicationRequest for TestWriteRequest {
    fn index(&self) -> &str {
        &self.index
    }
    fn routed_based_on_cluster_version(&self) -> u64 {
        self.meta.routed_based_on_cluster_version
    }
    fn set_routed_based_on_cluster_version(&mut self, version: u64) {
        self.meta.raise_routing_watermark(version);
    }
    fn on_retry(&mut self) {
        self.meta.retries += 1;
    }
    fn retries(&self) -> u32 {
        self.meta.retries
    }
}

/// Response carrying only the per-copy summary.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TestWriteResponse {
    /// Per-copy outcome summary.
    pub shard_info: ShardInfo,
}

impl ReplicationResponse for TestWriteResponse {
    fn set_shard_info(&mut self, shard_info: ShardInfo) {
        self.shard_info = shard_info;
    }
    fn shard_info(&self) -> &ShardInfo {
        &self.shard_info
    }
}

/// Handler that records where operations ran and injects failures.
#[derive(Debug, Default)]
pub struct TestWriteHandler {
    /// `(node, request)` per primary operation, in execution order.
    pub primary_ops: Mutex<Vec<(NodeId, TestWriteRequest)>>,
    /// `(node, request)` per successful replica operation.
    pub replica_ops: Mutex<Vec<(NodeId, TestWriteRequest)>>,
    /// Queued one-shot failures per node, consumed by `replica_op`.
    replica_failures: Mutex<HashMap<NodeId, VecDeque<Error>>>,
}

impl TestWriteHandler {
    /// Queue one replica-op failure on `node`.
    pub fn fail_next_replica_op(&self, node: NodeId, failure: Error) {
        self.replica_failures
            .lock()
            .entry(node)
            .or_default()
            .push_back(failure);
    }
}

#[async_trait]
impl ReplicationHandler for TestWriteHandler {
    type Request = TestWriteRequest;
    type ReplicaRequest = TestWriteRequest;
    type Response = TestWriteResponse;

    fn resolve_request(
        &self,
        _state: &ClusterState,
        index: &IndexMetadata,
        request: &mut Self::Request,
    ) -> Result<()> {
        request.set_shard_id(ShardId::new(index.index.clone(), request.shard));
        Self::resolve_wait_for_active_shards(index, request);
        Ok(())
    }

    async fn primary_op(
        &self,
        request: Self::Request,
        primary: &IndexShard,
    ) -> Result<PrimaryResult<Self::ReplicaRequest, Self::Response>> {
        let node = primary.routing_entry().current_node_id.unwrap_or_default();
        self.primary_ops.lock().push((node, request.clone()));
        Ok(PrimaryResult::success(request, TestWriteResponse::default()))
    }

    async fn replica_op(
        &self,
        request: &Self::ReplicaRequest,
        replica: &IndexShard,
    ) -> Result<ReplicaResult> {
        let node = replica.routing_entry().current_node_id.unwrap_or_default();
        if let Some(failure) = self
            .replica_failures
            .lock()
            .get_mut(&node)
            .and_then(VecDeque::pop_front)
        {
            return Err(failure);
        }
        self.replica_ops.lock().push((node, request.clone()));
        Ok(ReplicaResult::ok())
    }

    fn global_block_level(&self) -> Option<BlockLevel> {
        Some(BlockLevel::Write)
    }

    fn index_block_level(&self) -> Option<BlockLevel> {
        Some(BlockLevel::Write)
    }
}

/// Loopback transport dispatching RPCs to in-process actions, with
/// partition injection.
pub struct LoopbackTransport<H: ReplicationHandler> {
    nodes: RwLock<HashMap<NodeId, Arc<ReplicationAction<H>>>>,
    partitioned: RwLock<HashSet<NodeId>>,
    /// `(target node, routing watermark)` per reroute hop, in send order.
    pub rerouted: Mutex<Vec<(NodeId, u64)>>,
}

impl<H: ReplicationHandler> LoopbackTransport<H> {
    /// Empty transport.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            partitioned: RwLock::new(HashSet::new()),
            rerouted: Mutex::new(Vec::new()),
        }
    }

    /// Attach a node's action.
    pub fn register(&self, node: NodeId, action: Arc<ReplicationAction<H>>) {
        self.nodes.write().insert(node, action);
    }

    /// Make a node unreachable.
    pub fn partition(&self, node: NodeId) {
        self.partitioned.write().insert(node);
    }

    /// Make a node reachable again.
    pub fn heal(&self, node: NodeId) {
        self.partitioned.write().remove(&node);
    }

    fn target(&self, node: NodeId) -> Result<Arc<ReplicationAction<H>>> {
        if self.partitioned.read().contains(&node) {
            return Err(Error::ConnectTransport {
                node,
                reason: "node is partitioned".to_string(),
            });
        }
        self.nodes
            .read()
            .get(&node)
            .cloned()
            .ok_or_else(|| Error::ConnectTransport {
                node,
                reason: "no such node on the loopback transport".to_string(),
            })
    }
}

impl<H: ReplicationHandler> Default for LoopbackTransport<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<H: ReplicationHandler> ReplicationTransport<H::Request, H::ReplicaRequest, H::Response>
    for LoopbackTransport<H>
{
    async fn send_request(&self, node: NodeId, request: H::Request) -> Result<H::Response> {
        let action = self.target(node)?;
        self.rerouted
            .lock()
            .push((node, request.routed_based_on_cluster_version()));
        action.handle_request(request).await
    }

    async fn send_to_primary(
        &self,
        node: NodeId,
        request: ConcreteShardRequest<H::Request>,
    ) -> Result<H::Response> {
        let action = self.target(node)?;
        action.handle_primary_request(request).await
    }

    async fn send_to_replica(
        &self,
        node: NodeId,
        request: ConcreteShardRequest<H::ReplicaRequest>,
    ) -> Result<()> {
        let action = self.target(node)?;
        action.handle_replica_request(request).await
    }
}

/// One harness node.
pub struct TestNode {
    /// The node id.
    pub node_id: NodeId,
    /// The node's cluster-state service.
    pub cluster: Arc<ClusterService>,
    /// Shards hosted on the node.
    pub shards: Arc<IndexShardRegistry>,
    /// The node's failure reporter.
    pub reporter: Arc<RecordingFailureReporter>,
    /// The node's replication action.
    pub action: Arc<ReplicationAction<TestWriteHandler>>,
}

/// A loopback cluster of [`TestWriteHandler`] actions.
pub struct TestCluster {
    /// Handler shared by every node, for cross-node assertions.
    pub handler: Arc<TestWriteHandler>,
    /// The shared loopback transport.
    pub transport: Arc<LoopbackTransport<TestWriteHandler>>,
    nodes: HashMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Stand up a cluster with the given node ids.
    pub fn new(node_ids: &[NodeId]) -> Self {
        let handler = Arc::new(TestWriteHandler::default());
        let transport = Arc::new(LoopbackTransport::new());

        let mut nodes = HashMap::new();
        for &node_id in node_ids {
            let cluster = Arc::new(ClusterService::new(
                node_id,
                ClusterState::builder(0).build(),
            ));
            let shards = Arc::new(IndexShardRegistry::new());
            let reporter = Arc::new(RecordingFailureReporter::new());
            let action = Arc::new(ReplicationAction::new(
                ActionConfig::new("indices:data/write/test").with_executor("index"),
                handler.clone(),
                cluster.clone(),
                shards.clone(),
                transport.clone(),
                reporter.clone(),
            ));
            transport.register(node_id, action.clone());
            nodes.insert(
                node_id,
                TestNode {
                    node_id,
                    cluster,
                    shards,
                    reporter,
                    action,
                },
            );
        }

        Self {
            handler,
            transport,
            nodes,
        }
    }

    /// Access one node.
    pub fn node(&self, node_id: NodeId) -> &TestNode {
        self.nodes
            .get(&node_id)
            .unwrap_or_else(|| panic!("no such test node: {}", node_id))
    }

    /// Publish a state to every node, rebinding the local node id per node.
    pub fn publish_all(&self, state: &ClusterState) {
        for node in self.nodes.values() {
            self.publish_to(node.node_id, state);
        }
    }

    /// Publish a state to one node, rebinding the local node id.
    pub fn publish_to(&self, node_id: NodeId, state: &ClusterState) {
        let mut local = state.clone();
        local.nodes = local.nodes.for_local_node(node_id);
        self.node(node_id).cluster.publish(local);
    }

    /// Host a shard copy on a node.
    pub fn add_shard(
        &self,
        node_id: NodeId,
        routing: crate::cluster::ShardRouting,
        state: IndexShardState,
        primary_term: u64,
    ) -> Arc<IndexShard> {
        let shard = Arc::new(IndexShard::new(routing, state, primary_term));
        self.node(node_id).shards.register(shard.clone());
        shard
    }
}
