//! The replication action state machine.
//!
//! A mutation executes on the primary copy of its shard and then propagates
//! to every in-sync replica copy. The pipeline here owns the whole journey:
//!
//! ```text
//! caller ──▶ ReroutePhase ──▶ PrimaryPhase ──▶ ReplicationOperation
//!                │                 │                   │
//!                │                 │                   ├──▶ replica RPC ──▶ ReplicaPhase (node A)
//!                │                 │                   └──▶ replica RPC ──▶ ReplicaPhase (node B)
//!                │                 │
//!                │                 └─ acquires the primary operation permit,
//!                │                    runs the domain operation, delegates to
//!                │                    a relocation target when handed off
//!                │
//!                └─ resolves the shard from observed cluster state, routes
//!                   locally or remotely, retries on cluster-state changes
//! ```
//!
//! Safety rests on three identities every targeted RPC carries and every
//! receiver validates: the shard id, the allocation id of the addressed
//! copy, and the primary term the request was issued under. A stale
//! incarnation of a copy or a deposed primary can never apply an operation.

mod action;
mod operation;
mod primary;
mod primary_action;
mod proxy;
mod replica_action;
mod request;
mod reroute;
mod response;

pub use action::{ReplicationAction, ReplicationHandler};
pub use operation::{FailureReportOutcome, Primary, Replicas, ReplicationOperation};
pub use primary::{PrimaryResult, PrimaryShardReference, ReplicaResult};
pub use proxy::ReplicasProxy;
pub use request::{
    HasPrimaryTerm, HasShardId, HasTimeout, HasWaitForActiveShards, ReplicationMeta,
    ReplicationRequest,
};
pub use response::{ReplicationResponse, ShardFailure, ShardInfo};
