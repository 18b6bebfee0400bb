//! Typed request/response channel to other nodes.
//!
//! The actual byte framing, connection handling, and endpoint registration
//! live outside this crate; the pipeline only needs to address the three
//! logical endpoints of an action on a target node. Implementations map
//! connection-level failures to [`Error::ConnectTransport`] so routing can
//! classify them as retryable.

use super::rpc::ConcreteShardRequest;
use crate::error::Result;
use crate::types::NodeId;
use async_trait::async_trait;

/// Outbound RPC channel for one replication action.
///
/// `Req`, `RepReq`, and `Resp` are the action's request, replica-request,
/// and response payloads.
#[async_trait]
pub trait ReplicationTransport<Req, RepReq, Resp>: Send + Sync + 'static {
    /// Send the raw request to the reroute endpoint (`<action>`) on `node`.
    async fn send_request(&self, node: NodeId, request: Req) -> Result<Resp>;

    /// Send a targeted request to the primary endpoint (`<action>[p]`) on
    /// `node`.
    async fn send_to_primary(
        &self,
        node: NodeId,
        request: ConcreteShardRequest<Req>,
    ) -> Result<Resp>;

    /// Send a targeted request to the replica endpoint (`<action>[r]`) on
    /// `node`.
    async fn send_to_replica(
        &self,
        node: NodeId,
        request: ConcreteShardRequest<RepReq>,
    ) -> Result<()>;
}
