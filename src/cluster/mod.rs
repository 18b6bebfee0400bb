//! Cluster-state model: nodes, routing, metadata, blocks, and the observer
//! the replication pipeline retries on.
//!
//! The replication core is a pure consumer of this module: states arrive
//! from outside (master publication), and the pipeline only ever reads the
//! latest snapshot or waits for the next one.

mod block;
mod metadata;
mod node;
mod routing;
mod service;
mod shard_failed;
mod state;

pub use block::{BlockLevel, ClusterBlock, ClusterBlocks};
pub use metadata::{IndexMetadata, IndexState, Metadata};
pub use node::{DiscoveryNode, DiscoveryNodes};
pub use routing::{RoutingTable, ShardRouting, ShardRoutingState, ShardRoutingTable};
pub use service::{ClusterService, ClusterStateObserver, ObservedChange};
pub use shard_failed::{NoopShardFailureReporter, ShardFailureReporter};
pub use state::{ClusterState, ClusterStateBuilder};
