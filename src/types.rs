//! Core identifiers and small shared types for the replication subsystem.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Identity of an index, stable across the index lifetime.
///
/// The `uuid` distinguishes an index from a deleted-and-recreated index
/// with the same name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexId {
    /// Human-readable index name.
    pub name: String,
    /// Unique identifier assigned at index creation.
    pub uuid: String,
}

impl IndexId {
    /// Create a new index identity with a fresh uuid.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Create an index identity with a fixed uuid.
    pub fn with_uuid(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: uuid.into(),
        }
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.name)
    }
}

/// Identity of one shard of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// The owning index.
    pub index: IndexId,
    /// Shard number within the index.
    pub id: u32,
}

impl ShardId {
    /// Create a new shard id.
    pub fn new(index: IndexId, id: u32) -> Self {
        Self { index, id }
    }

    /// The index name this shard belongs to.
    pub fn index_name(&self) -> &str {
        &self.index.name
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index.name, self.id)
    }
}

/// Identity of one particular copy of a shard on one particular node.
///
/// A fresh id is assigned whenever a copy is allocated. While a copy
/// relocates, the source carries a `relocation_id` naming the target copy's
/// id, so messages can be aimed at either incarnation unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId {
    /// The id of this copy.
    pub id: String,
    /// Id of the relocation target copy, if this copy is relocating.
    pub relocation_id: Option<String>,
}

impl AllocationId {
    /// Create a fresh allocation id for a newly assigned copy.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            relocation_id: None,
        }
    }

    /// Create an allocation id with a fixed id, for rebuilding known copies.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relocation_id: None,
        }
    }

    /// Derive the relocating variant of this id, pointing at a fresh target id.
    pub fn begin_relocation(&self) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: Some(Uuid::new_v4().to_string()),
        }
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Version of a node, doubling as the negotiated wire protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl NodeVersion {
    /// First version that carries the primary term on the request envelope
    /// rather than on the inner request.
    pub const TERM_ON_ENVELOPE: NodeVersion = NodeVersion { major: 5, minor: 6 };

    /// Version of this build.
    pub const CURRENT: NodeVersion = NodeVersion { major: 5, minor: 6 };

    /// Create a version.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// How many active shard copies must be available before a write proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveShardCount {
    /// Not set on the request; resolved from index settings during routing.
    Default,
    /// Do not wait for any copies.
    None,
    /// Wait for the primary only.
    One,
    /// Wait for all copies, assigned or not.
    All,
    /// Wait for a specific number of active copies.
    Count(u32),
}

impl ActiveShardCount {
    /// Whether `active` out of `copies` total copies satisfies this count.
    ///
    /// Must not be called before [`ActiveShardCount::Default`] has been
    /// resolved from index settings.
    pub fn enough(&self, active: usize, copies: usize) -> bool {
        match self {
            ActiveShardCount::Default => {
                debug_assert!(false, "wait-for-active-shards must be resolved before checking");
                active >= 1
            }
            ActiveShardCount::None => true,
            ActiveShardCount::One => active >= 1,
            ActiveShardCount::All => active >= copies,
            ActiveShardCount::Count(n) => active >= *n as usize,
        }
    }
}

impl fmt::Display for ActiveShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveShardCount::Default => write!(f, "default"),
            ActiveShardCount::None => write!(f, "none"),
            ActiveShardCount::One => write!(f, "one"),
            ActiveShardCount::All => write!(f, "all"),
            ActiveShardCount::Count(n) => write!(f, "{}", n),
        }
    }
}

/// Tracks which phase of the replication pipeline a request is in.
///
/// Phases are advisory, for task listings and tests. The lifecycle is
/// `routing` → (`waiting_on_primary` | `rerouted`) → `primary` |
/// `primary_delegation` | `replica` → `finished` | `failed`, with
/// `waiting_for_retry` interleaved while the request sits out a
/// cluster-state change.
#[derive(Debug)]
pub struct ReplicationTask {
    phase: RwLock<&'static str>,
}

impl ReplicationTask {
    /// Create a task in the `started` phase.
    pub fn new() -> Self {
        Self {
            phase: RwLock::new("started"),
        }
    }

    /// The current phase.
    pub fn phase(&self) -> &'static str {
        *self.phase.read()
    }

    /// Move the task to a new phase.
    pub fn set_phase(&self, phase: &'static str) {
        *self.phase.write() = phase;
    }
}

impl Default for ReplicationTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-shot completion guard for a request.
///
/// Completing twice is a programming error: debug builds hit the assertion,
/// release builds log and drop the second completion.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    finished: AtomicBool,
}

impl CompletionLatch {
    /// Create an open latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to complete. Returns `true` exactly once.
    pub fn complete(&self, context: &str) -> bool {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            true
        } else {
            debug_assert!(false, "{} called but operation is already finished", context);
            tracing::warn!(context, "request completed twice, dropping second completion");
            false
        }
    }

    /// Whether the latch has fired.
    pub fn is_complete(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
