//! End-to-end tests of the replication pipeline over the loopback cluster.
//!
//! Each test stands up a small topology, publishes cluster states to every
//! node, and drives full routing → primary → replica cycles, including the
//! failure-retry loop.

#[cfg(test)]
mod tests {
    use crate::cluster::{
        BlockLevel, ClusterBlock, ClusterBlocks, ClusterState, DiscoveryNode, DiscoveryNodes,
        IndexMetadata, Metadata, RoutingTable, ShardRouting, ShardRoutingState,
        ShardRoutingTable,
    };
    use crate::error::Error;
    use crate::network::ConcreteShardRequest;
    use crate::replication::{HasShardId, HasWaitForActiveShards, ReplicationRequest};
    use crate::shard::IndexShardState;
    use crate::testing::{ReportBehavior, TestCluster, TestWriteRequest};
    use crate::types::{ActiveShardCount, IndexId, ReplicationTask, ShardId};
    use std::time::Duration;

    struct Fixture {
        cluster: TestCluster,
        index_id: IndexId,
        shard_id: ShardId,
        primary: ShardRouting,
        replica: ShardRouting,
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn index_id() -> IndexId {
        IndexId::with_uuid("logs", "logs-uuid")
    }

    fn state_for(
        version: u64,
        metadata: IndexMetadata,
        table: ShardRoutingTable,
    ) -> ClusterState {
        ClusterState::builder(version)
            .nodes(
                DiscoveryNodes::new(0)
                    .with_node(DiscoveryNode::new(1, "n1"))
                    .with_node(DiscoveryNode::new(2, "n2")),
            )
            .metadata(Metadata::new().with_index(metadata))
            .routing_table(RoutingTable::new().with_shard_table(table))
            .build()
    }

    /// Shard 0 of `logs`: primary started on node 1, replica started on
    /// node 2, both hosting a shard handle at term 1.
    fn two_node_fixture() -> Fixture {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let primary = ShardRouting::started(shard_id.clone(), 1, true);
        let replica = ShardRouting::started(shard_id.clone(), 2, false);

        let state = state_for(
            1,
            IndexMetadata::new(index_id.clone(), 1),
            ShardRoutingTable::new(shard_id.clone(), vec![primary.clone(), replica.clone()]),
        );
        cluster.add_shard(1, primary.clone(), IndexShardState::Started, 1);
        cluster.add_shard(2, replica.clone(), IndexShardState::Started, 1);
        cluster.publish_all(&state);

        Fixture {
            cluster,
            index_id,
            shard_id,
            primary,
            replica,
        }
    }

    fn request() -> TestWriteRequest {
        TestWriteRequest::new("logs", "doc-1")
    }

    #[tokio::test]
    async fn test_write_replicates_to_all_copies() {
        let f = two_node_fixture();

        let response = f.cluster.node(1).action.execute(request()).await.unwrap();

        assert_eq!(response.shard_info.total, 2);
        assert_eq!(response.shard_info.successful, 2);
        assert_eq!(response.shard_info.failed(), 0);

        let primary_ops = f.cluster.handler.primary_ops.lock();
        assert_eq!(primary_ops.len(), 1);
        assert_eq!(primary_ops[0].0, 1);
        let replica_ops = f.cluster.handler.replica_ops.lock();
        assert_eq!(replica_ops.len(), 1);
        assert_eq!(replica_ops[0].0, 2);

        // the primary operation permit is back
        let shard = f.cluster.node(1).shards.shard(&f.shard_id).unwrap();
        assert_eq!(shard.active_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_replica_is_reported_and_caller_sees_success() {
        let f = two_node_fixture();
        f.cluster.handler.fail_next_replica_op(
            2,
            Error::ShardNotFound {
                shard_id: f.shard_id.clone(),
                reason: "copy has been reallocated".into(),
            },
        );

        let response = f.cluster.node(1).action.execute(request()).await.unwrap();

        assert_eq!(response.shard_info.total, 2);
        assert_eq!(response.shard_info.successful, 1);
        assert_eq!(response.shard_info.failed(), 1);
        let failure = &response.shard_info.failures[0];
        assert_eq!(failure.node_id, Some(2));
        assert_eq!(
            failure.allocation_id.as_deref(),
            f.replica.allocation_id_str()
        );

        let reports = f.cluster.node(1).reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].allocation_id,
            f.replica.allocation_id_str().unwrap()
        );
        assert_eq!(reports[0].primary_term, 1);
    }

    #[tokio::test]
    async fn test_primary_demotion_retries_against_new_primary() {
        let f = two_node_fixture();
        f.cluster
            .node(1)
            .reporter
            .set_behavior(ReportBehavior::DemotePrimary);
        f.cluster.handler.fail_next_replica_op(
            2,
            Error::ShardNotFound {
                shard_id: f.shard_id.clone(),
                reason: "copy has been reallocated".into(),
            },
        );

        let action = f.cluster.node(1).action.clone();
        let running = tokio::spawn(async move { action.execute(request()).await });

        // let the first attempt run into the demotion and park on the observer
        tokio::time::sleep(Duration::from_millis(100)).await;

        // master's view: the replica on node 2 was promoted under term 2
        let promoted = ShardRouting {
            shard_id: f.shard_id.clone(),
            current_node_id: Some(2),
            relocating_node_id: None,
            primary: true,
            state: ShardRoutingState::Started,
            allocation_id: f.replica.allocation_id.clone(),
        };
        f.cluster
            .add_shard(2, promoted.clone(), IndexShardState::Started, 2);
        let state = state_for(
            2,
            IndexMetadata::new(f.index_id.clone(), 1).with_primary_term(0, 2),
            ShardRoutingTable::new(f.shard_id.clone(), vec![promoted]),
        );
        f.cluster.publish_all(&state);

        let response = running.await.unwrap().unwrap();
        assert_eq!(response.shard_info.total, 1);
        assert_eq!(response.shard_info.successful, 1);

        // the demoted primary failed itself and the retry ran on node 2
        let old_primary = f.cluster.node(1).shards.shard(&f.shard_id).unwrap();
        assert!(old_primary.is_failed());
        let primary_ops = f.cluster.handler.primary_ops.lock();
        assert_eq!(primary_ops.len(), 2);
        assert_eq!(primary_ops[0].0, 1);
        assert_eq!(primary_ops[1].0, 2);
    }

    #[tokio::test]
    async fn test_relocation_handoff_delegates_to_target_node() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let source = ShardRouting::started(shard_id.clone(), 1, true).relocate_to(2);
        let target = source.relocation_target().unwrap();

        let state = state_for(
            1,
            IndexMetadata::new(index_id, 1),
            ShardRoutingTable::new(shard_id.clone(), vec![source.clone(), target.clone()]),
        );
        cluster.add_shard(1, source.clone(), IndexShardState::Relocated, 1);
        cluster.add_shard(2, target.clone(), IndexShardState::Started, 1);
        cluster.publish_all(&state);

        let response = cluster.node(1).action.execute(request()).await.unwrap();

        // one response; the primary phase ran on the relocation target and
        // the handed-off copy received the operation as a replica
        assert_eq!(response.shard_info.total, 2);
        assert_eq!(response.shard_info.successful, 2);
        let primary_ops = cluster.handler.primary_ops.lock();
        assert_eq!(primary_ops.len(), 1);
        assert_eq!(primary_ops[0].0, 2);
        let replica_ops = cluster.handler.replica_ops.lock();
        assert_eq!(replica_ops.len(), 1);
        assert_eq!(replica_ops[0].0, 1);
    }

    #[tokio::test]
    async fn test_stale_receiver_waits_for_fresher_state() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let primary_on_2 = ShardRouting::started(shard_id.clone(), 2, true);
        // node 2's stale view still places the primary on node 1
        let stale_primary_on_1 = ShardRouting::started(shard_id.clone(), 1, true);

        let fresh = state_for(
            10,
            IndexMetadata::new(index_id.clone(), 1),
            ShardRoutingTable::new(shard_id.clone(), vec![primary_on_2.clone()]),
        );
        let stale = state_for(
            9,
            IndexMetadata::new(index_id, 1),
            ShardRoutingTable::new(shard_id.clone(), vec![stale_primary_on_1]),
        );
        cluster.add_shard(2, primary_on_2, IndexShardState::Started, 1);
        cluster.publish_to(1, &fresh);
        cluster.publish_to(2, &stale);

        let action = cluster.node(1).action.clone();
        let running = tokio::spawn(async move { action.execute(request()).await });

        // node 2 must park rather than bounce the request back to node 1
        tokio::time::sleep(Duration::from_millis(100)).await;
        cluster.publish_to(2, &fresh);

        let response = running.await.unwrap().unwrap();
        assert_eq!(response.shard_info.successful, 1);

        // a single forwarding hop, carrying the sender's state version
        let rerouted = cluster.transport.rerouted.lock();
        assert_eq!(rerouted.as_slice(), &[(2, 10)]);
        let primary_ops = cluster.handler.primary_ops.lock();
        assert_eq!(primary_ops.len(), 1);
        assert_eq!(primary_ops[0].0, 2);
    }

    #[tokio::test]
    async fn test_closed_index_fails_immediately() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let primary = ShardRouting::started(shard_id.clone(), 1, true);

        let state = state_for(
            1,
            IndexMetadata::new(index_id, 1).closed(),
            ShardRoutingTable::new(shard_id, vec![primary]),
        );
        cluster.publish_all(&state);

        let task = ReplicationTask::new();
        let err = cluster
            .node(1)
            .action
            .execute_with_task(request(), &task)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexClosed(_)));
        assert_eq!(task.phase(), "failed");
        assert!(cluster.handler.primary_ops.lock().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_all_with_unassigned_replica_fails_before_fan_out() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let primary = ShardRouting::started(shard_id.clone(), 1, true);
        let unassigned = ShardRouting::unassigned(shard_id.clone(), false);

        let state = state_for(
            1,
            IndexMetadata::new(index_id, 1),
            ShardRoutingTable::new(shard_id.clone(), vec![primary.clone(), unassigned]),
        );
        cluster.add_shard(1, primary, IndexShardState::Started, 1);
        cluster.publish_all(&state);

        let mut req = request().with_timeout(Duration::from_millis(150));
        req.set_wait_for_active_shards(ActiveShardCount::All);

        let err = cluster.node(1).action.execute(req).await.unwrap_err();
        assert!(matches!(err, Error::UnavailableShards { .. }));
        assert!(cluster.handler.replica_ops.lock().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_zero_term_is_resolved_on_the_primary() {
        let f = two_node_fixture();

        let mut req = request();
        req.set_shard_id(f.shard_id.clone());
        req.set_wait_for_active_shards(ActiveShardCount::One);
        let concrete =
            ConcreteShardRequest::new(req, f.primary.allocation_id_str().unwrap(), 0);

        let response = f
            .cluster
            .node(1)
            .action
            .handle_primary_request(concrete)
            .await
            .unwrap();
        assert_eq!(response.shard_info.total, 2);
        assert_eq!(response.shard_info.successful, 2);
    }

    #[tokio::test]
    async fn test_zero_timeout_makes_first_routing_failure_terminal() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let unassigned = ShardRouting::unassigned(shard_id.clone(), true);

        let state = state_for(
            1,
            IndexMetadata::new(index_id, 1),
            ShardRoutingTable::new(shard_id, vec![unassigned]),
        );
        cluster.publish_all(&state);

        let req = request().with_timeout(Duration::ZERO);
        let err = cluster.node(1).action.execute(req).await.unwrap_err();
        assert!(matches!(err, Error::UnavailableShards { .. }));
    }

    #[tokio::test]
    async fn test_replica_rejects_operations_under_an_old_term() {
        let f = two_node_fixture();
        // the copy on node 2 has already seen term 5
        f.cluster
            .add_shard(2, f.replica.clone(), IndexShardState::Started, 5);

        let mut req = request();
        req.set_shard_id(f.shard_id.clone());
        let concrete =
            ConcreteShardRequest::new(req, f.replica.allocation_id_str().unwrap(), 3);

        let err = f
            .cluster
            .node(2)
            .action
            .handle_replica_request(concrete)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IllegalShardState { .. }));
    }

    #[tokio::test]
    async fn test_replica_targeting_a_stale_allocation_is_rejected() {
        let f = two_node_fixture();

        let mut req = request();
        req.set_shard_id(f.shard_id.clone());
        let concrete = ConcreteShardRequest::new(req, "previous-incarnation", 1);

        let err = f
            .cluster
            .node(2)
            .action
            .handle_replica_request(concrete)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotFound { .. }));
    }

    #[tokio::test]
    async fn test_retry_on_replica_redispatches_after_state_change() {
        let f = two_node_fixture();
        f.cluster.handler.fail_next_replica_op(
            2,
            Error::RetryOnReplica {
                shard_id: f.shard_id.clone(),
                reason: "mappings not yet applied".into(),
            },
        );

        let action = f.cluster.node(1).action.clone();
        let running = tokio::spawn(async move { action.execute(request()).await });

        // the replica parks on its observer until a fresh state arrives
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = state_for(
            2,
            IndexMetadata::new(f.index_id.clone(), 1),
            ShardRoutingTable::new(
                f.shard_id.clone(),
                vec![f.primary.clone(), f.replica.clone()],
            ),
        );
        f.cluster.publish_all(&state);

        let response = running.await.unwrap().unwrap();
        assert_eq!(response.shard_info.total, 2);
        assert_eq!(response.shard_info.successful, 2);
        let replica_ops = f.cluster.handler.replica_ops.lock();
        assert_eq!(replica_ops.len(), 1);
        assert_eq!(replica_ops[0].1.retries(), 1);
    }

    #[tokio::test]
    async fn test_replica_on_unknown_node_is_failed_like_any_replica() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let primary = ShardRouting::started(shard_id.clone(), 1, true);
        // node 3 is not part of the cluster state's node set
        let orphan_replica = ShardRouting::started(shard_id.clone(), 3, false);

        let state = state_for(
            1,
            IndexMetadata::new(index_id, 1),
            ShardRoutingTable::new(
                shard_id.clone(),
                vec![primary.clone(), orphan_replica.clone()],
            ),
        );
        cluster.add_shard(1, primary, IndexShardState::Started, 1);
        cluster.publish_all(&state);

        let response = cluster.node(1).action.execute(request()).await.unwrap();
        assert_eq!(response.shard_info.total, 2);
        assert_eq!(response.shard_info.successful, 1);
        assert_eq!(response.shard_info.failed(), 1);
        assert!(matches!(
            response.shard_info.failures[0].cause,
            Error::NoNodeAvailable(3)
        ));

        let reports = cluster.node(1).reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].allocation_id,
            orphan_replica.allocation_id_str().unwrap()
        );
    }

    #[tokio::test]
    async fn test_partitioned_replica_node_is_failed_and_reported() {
        let f = two_node_fixture();
        f.cluster.transport.partition(2);

        let response = f.cluster.node(1).action.execute(request()).await.unwrap();
        assert_eq!(response.shard_info.total, 2);
        assert_eq!(response.shard_info.successful, 1);
        assert_eq!(response.shard_info.failed(), 1);
        assert!(matches!(
            response.shard_info.failures[0].cause,
            Error::ConnectTransport { node: 2, .. }
        ));
        assert_eq!(f.cluster.node(1).reporter.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_block_holds_the_request_until_lifted() {
        let f = two_node_fixture();

        let blocked = {
            let mut state = state_for(
                2,
                IndexMetadata::new(f.index_id.clone(), 1),
                ShardRoutingTable::new(
                    f.shard_id.clone(),
                    vec![f.primary.clone(), f.replica.clone()],
                ),
            );
            state.blocks = ClusterBlocks::new().with_global_block(ClusterBlock::new(
                1,
                "state not recovered / initialized",
                true,
                vec![BlockLevel::Write],
            ));
            state
        };
        f.cluster.publish_all(&blocked);

        let action = f.cluster.node(1).action.clone();
        let running = tokio::spawn(async move { action.execute(request()).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.cluster.handler.primary_ops.lock().is_empty());

        let lifted = state_for(
            3,
            IndexMetadata::new(f.index_id.clone(), 1),
            ShardRoutingTable::new(
                f.shard_id.clone(),
                vec![f.primary.clone(), f.replica.clone()],
            ),
        );
        f.cluster.publish_all(&lifted);

        let response = running.await.unwrap().unwrap();
        assert_eq!(response.shard_info.successful, 2);
    }

    #[tokio::test]
    async fn test_shadow_replica_index_skips_replication() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let primary = ShardRouting::started(shard_id.clone(), 1, true);
        let replica = ShardRouting::started(shard_id.clone(), 2, false);

        let state = state_for(
            1,
            IndexMetadata::new(index_id, 1).with_shadow_replicas(),
            ShardRoutingTable::new(shard_id.clone(), vec![primary.clone(), replica.clone()]),
        );
        cluster.add_shard(1, primary, IndexShardState::Started, 1);
        cluster.add_shard(2, replica, IndexShardState::Started, 1);
        cluster.publish_all(&state);

        let response = cluster.node(1).action.execute(request()).await.unwrap();
        assert_eq!(response.shard_info.total, 1);
        assert_eq!(response.shard_info.successful, 1);
        assert!(cluster.handler.replica_ops.lock().is_empty());
    }

    #[tokio::test]
    async fn test_node_shutdown_fails_waiting_requests() {
        init_tracing();
        let cluster = TestCluster::new(&[1, 2]);
        let index_id = index_id();
        let shard_id = ShardId::new(index_id.clone(), 0);
        let unassigned = ShardRouting::unassigned(shard_id.clone(), true);

        let state = state_for(
            1,
            IndexMetadata::new(index_id, 1),
            ShardRoutingTable::new(shard_id, vec![unassigned]),
        );
        cluster.publish_all(&state);

        let action = cluster.node(1).action.clone();
        let running = tokio::spawn(async move {
            action
                .execute(request().with_timeout(Duration::from_secs(30)))
                .await
        });

        // the request is parked waiting for the primary to be assigned
        tokio::time::sleep(Duration::from_millis(100)).await;
        cluster.node(1).cluster.close();

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NodeClosed(1)));
    }

    #[tokio::test]
    async fn test_non_retryable_block_fails_the_request() {
        let f = two_node_fixture();

        let mut state = state_for(
            2,
            IndexMetadata::new(f.index_id.clone(), 1),
            ShardRoutingTable::new(
                f.shard_id.clone(),
                vec![f.primary.clone(), f.replica.clone()],
            ),
        );
        state.blocks = ClusterBlocks::new().with_index_block(
            "logs",
            ClusterBlock::new(8, "index write (api)", false, vec![BlockLevel::Write]),
        );
        f.cluster.publish_all(&state);

        let err = f.cluster.node(1).action.execute(request()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ClusterBlocked {
                retryable: false,
                ..
            }
        ));
    }
}
