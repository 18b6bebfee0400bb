//! Wire envelope and transport seam.

mod rpc;
mod transport;

pub use rpc::{
    frame, read_string, read_vlong, unframe, write_string, write_vlong, ConcreteShardRequest,
};
pub use transport::ReplicationTransport;
