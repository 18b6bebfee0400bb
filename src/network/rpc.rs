//! Wire envelope for primary and replica RPCs.
//!
//! A [`ConcreteShardRequest`] aims an inner request at one specific shard
//! copy: the receiver rejects it unless both the allocation id and the
//! primary term match its own identity. On the wire the envelope is
//!
//! ```text
//! target allocation id : vint length + UTF-8 bytes
//! primary term         : vlong, present iff the peer speaks >= 5.6
//! inner request        : bincode payload
//! ```
//!
//! Peers older than 5.6 expect the term on the inner request instead; the
//! constructor mirrors it there so both encodings stay consistent.

use crate::error::{Error, Result};
use crate::replication::{HasPrimaryTerm, ReplicationRequest};
use crate::types::NodeVersion;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Wrapper aiming a request at a specific allocation id under a specific
/// primary term.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteShardRequest<R> {
    /// Allocation id of the copy this request is meant for.
    pub target_allocation_id: String,
    /// Primary term the sender issued the request under.
    pub primary_term: u64,
    /// The domain request.
    pub request: R,
}

impl<R: ReplicationRequest> ConcreteShardRequest<R> {
    /// Wrap a request. The term is mirrored onto the inner request for
    /// peers that still read it from there.
    pub fn new(mut request: R, target_allocation_id: impl Into<String>, primary_term: u64) -> Self {
        request.set_primary_term(primary_term);
        Self {
            target_allocation_id: target_allocation_id.into(),
            primary_term,
            request,
        }
    }

    /// Encode for a peer speaking `peer_version`.
    pub fn write_to(&self, buf: &mut BytesMut, peer_version: NodeVersion) -> Result<()> {
        write_string(buf, &self.target_allocation_id);
        if peer_version >= NodeVersion::TERM_ON_ENVELOPE {
            write_vlong(buf, self.primary_term);
        } else {
            debug_assert_eq!(
                self.request.primary_term(),
                self.primary_term,
                "term on inner replication request not properly set"
            );
        }
        let payload = bincode::serialize(&self.request)?;
        buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self, peer_version: NodeVersion) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf, peer_version)?;
        Ok(buf.freeze())
    }

    /// Decode an envelope written by a peer speaking `peer_version`.
    pub fn read_from(buf: &mut impl Buf, peer_version: NodeVersion) -> Result<Self> {
        let target_allocation_id = read_string(buf)?;
        let envelope_term = if peer_version >= NodeVersion::TERM_ON_ENVELOPE {
            Some(read_vlong(buf)?)
        } else {
            None
        };
        let remaining = buf.copy_to_bytes(buf.remaining());
        let request: R = bincode::deserialize(&remaining)?;
        // pre-5.6 peers carry the term on the inner request only
        let primary_term = envelope_term.unwrap_or_else(|| request.primary_term());
        Ok(Self {
            target_allocation_id,
            primary_term,
            request,
        })
    }
}

impl<R: fmt::Debug> fmt::Display for ConcreteShardRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request: {:?}, target allocation id: {}, primary term: {}",
            self.request, self.target_allocation_id, self.primary_term
        )
    }
}

/// Largest frame accepted off the wire.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame a payload with a big-endian u32 length prefix for TCP transmission.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Split one length-prefixed frame off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete.
pub fn unframe(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Serialization(format!(
            "frame of [{}] bytes exceeds the [{}] byte limit",
            len, MAX_FRAME_SIZE
        )));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Write a variable-length unsigned 64-bit integer, 7 bits per byte.
pub fn write_vlong(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read a variable-length unsigned 64-bit integer.
pub fn read_vlong(buf: &mut impl Buf) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(Error::Serialization("truncated vlong".to_string()));
        }
        if shift > 63 {
            return Err(Error::Serialization("vlong too long".to_string()));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Write a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, value: &str) {
    write_vlong(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

/// Read a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut impl Buf) -> Result<String> {
    let len = read_vlong(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Serialization("truncated string".to_string()));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{
        HasShardId, HasTimeout, HasWaitForActiveShards, ReplicationMeta,
    };
    use crate::types::{ActiveShardCount, ShardId};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DocRequest {
        meta: ReplicationMeta,
        index: String,
        payload: String,
    }

    impl HasShardId for DocRequest {
        fn shard_id(&self) -> Option<&ShardId> {
            self.meta.shard_id.as_ref()
        }
        fn set_shard_id(&mut self, shard_id: ShardId) {
            self.meta.shard_id = Some(shard_id);
        }
    }

    impl HasPrimaryTerm for DocRequest {
        fn primary_term(&self) -> u64 {
            self.meta.primary_term
        }
        fn set_primary_term(&mut self, term: u64) {
            self.meta.primary_term = term;
        }
    }

    impl HasTimeout for DocRequest {
        fn timeout(&self) -> Duration {
            self.meta.timeout
        }
    }

    impl HasWaitForActiveShards for DocRequest {
        fn wait_for_active_shards(&self) -> ActiveShardCount {
            self.meta.wait_for_active_shards
        }
        fn set_wait_for_active_shards(&mut self, count: ActiveShardCount) {
            self.meta.wait_for_active_shards = count;
        }
    }

    impl ReplicationRequest for DocRequest {
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

    fn doc_request() -> DocRequest {
        DocRequest {
            meta: ReplicationMeta::new(),
            index: "logs".to_string(),
            payload: "doc-body".to_string(),
        }
    }

    #[test]
    fn test_vlong_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            write_vlong(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(read_vlong(&mut bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_vlong_truncated() {
        let mut buf = BytesMut::new();
        write_vlong(&mut buf, 100_000);
        let mut truncated = buf.freeze().slice(0..1);
        assert!(read_vlong(&mut truncated).is_err());
    }

    #[test]
    fn test_frame_round_trip() {
        let payload = b"frame-me";
        let framed = frame(payload);
        let mut buf = BytesMut::from(&framed[..]);
        let out = unframe(&mut buf).unwrap().unwrap();
        assert_eq!(&out[..], payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unframe_waits_for_complete_frame() {
        let framed = frame(b"split across reads");
        let mut buf = BytesMut::from(&framed[..6]);
        assert!(unframe(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&framed[6..]);
        assert!(unframe(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_unframe_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(unframe(&mut buf).is_err());
    }

    #[test]
    fn test_round_trip_current_version() {
        let concrete = ConcreteShardRequest::new(doc_request(), "alloc-1", 7);
        let mut bytes = concrete.to_bytes(NodeVersion::CURRENT).unwrap();
        let decoded: ConcreteShardRequest<DocRequest> =
            ConcreteShardRequest::read_from(&mut bytes, NodeVersion::CURRENT).unwrap();
        assert_eq!(decoded, concrete);
        assert_eq!(decoded.primary_term, 7);
    }

    #[test]
    fn test_round_trip_legacy_version_reads_term_from_inner_request() {
        let legacy = NodeVersion::new(5, 4);
        let concrete = ConcreteShardRequest::new(doc_request(), "alloc-1", 7);
        let mut bytes = concrete.to_bytes(legacy).unwrap();
        let decoded: ConcreteShardRequest<DocRequest> =
            ConcreteShardRequest::read_from(&mut bytes, legacy).unwrap();
        assert_eq!(decoded.primary_term, 7);
        assert_eq!(decoded.request.primary_term(), 7);
        assert_eq!(decoded, concrete);
    }

    #[test]
    fn test_legacy_encoding_is_smaller_by_the_envelope_term() {
        let concrete = ConcreteShardRequest::new(doc_request(), "alloc-1", 7);
        let current = concrete.to_bytes(NodeVersion::CURRENT).unwrap();
        let legacy = concrete.to_bytes(NodeVersion::new(5, 4)).unwrap();
        assert_eq!(current.len(), legacy.len() + 1);
    }
}
