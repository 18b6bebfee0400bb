//! Node-local shard handles and their operation permits.

mod index_shard;
mod registry;

pub use index_shard::{IndexShard, IndexShardState, OperationPermit};
pub use registry::IndexShardRegistry;
