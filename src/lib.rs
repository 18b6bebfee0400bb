//! Write-replication core for a sharded, leader-per-shard indexing cluster.
//!
//! Every mutation executes on the primary copy of its shard and then
//! propagates to all in-sync replica copies under a set of safety
//! invariants: requests carry the primary term they were issued under and
//! the allocation id of the exact copy they target, replicas refuse
//! operations from deposed primaries, and at most one primary reference is
//! active per shard and term.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ReplicationAction                        │
//! │                                                              │
//! │   ReroutePhase ──▶ PrimaryPhase ──▶ ReplicationOperation     │
//! │        ▲                │                    │               │
//! │        │                │                    ▼               │
//! │   ClusterStateObserver  │              ReplicasProxy ──▶ RPC │
//! │   (retry on new state)  ▼                    │               │
//! │                  IndexShard permits          ▼               │
//! │                                        ReplicaPhase          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cluster-state service, the per-shard storage engine, the master's
//! shard-failure handling, and the byte-level transport are consumed as
//! capabilities; this crate owns the state machine between them.
//!
//! # Example
//!
//! ```rust,ignore
//! use repliqa::config::ActionConfig;
//! use repliqa::replication::ReplicationAction;
//! use std::sync::Arc;
//!
//! let action = ReplicationAction::new(
//!     ActionConfig::new("indices:data/write/index").with_executor("index"),
//!     handler,      // domain operations on primary and replica copies
//!     cluster,      // cluster-state service of this node
//!     shards,       // shards hosted on this node
//!     transport,    // RPC channel to other nodes
//!     reporter,     // shard-failure reports to the master
//! );
//!
//! let response = action.execute(request).await?;
//! println!("{}", response.shard_info());
//! ```
//!
//! # Consistency model
//!
//! - Operations on one `(shard, primary term)` pair serialize against term
//!   changes and relocation hand-offs through the shard's operation permits.
//! - Replica RPCs of one operation run in parallel and complete in any
//!   order; the aggregate response assigns each targeted copy exactly one
//!   outcome.
//! - Partial replica failures do not fail the caller's request; they are
//!   reported to the master and surfaced in the response's `ShardInfo`.

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod replication;
pub mod shard;
pub mod testing;
pub mod types;

pub use config::{ActionConfig, RpcPriority, TransportOptions};
pub use error::{Error, Result};
pub use types::{
    ActiveShardCount, AllocationId, CompletionLatch, IndexId, NodeId, NodeVersion,
    ReplicationTask, ShardId,
};

pub use cluster::{
    BlockLevel, ClusterBlock, ClusterBlocks, ClusterService, ClusterState, ClusterStateBuilder,
    ClusterStateObserver, DiscoveryNode, DiscoveryNodes, IndexMetadata, IndexState, Metadata,
    NoopShardFailureReporter, ObservedChange, RoutingTable, ShardFailureReporter, ShardRouting,
    ShardRoutingState, ShardRoutingTable,
};

pub use shard::{IndexShard, IndexShardRegistry, IndexShardState, OperationPermit};

pub use network::{ConcreteShardRequest, ReplicationTransport};

pub use replication::{
    FailureReportOutcome, HasPrimaryTerm, HasShardId, HasTimeout, HasWaitForActiveShards,
    Primary, PrimaryResult, PrimaryShardReference, ReplicaResult, Replicas, ReplicasProxy,
    ReplicationAction, ReplicationHandler, ReplicationMeta, ReplicationOperation,
    ReplicationRequest, ReplicationResponse, ShardFailure, ShardInfo,
};
