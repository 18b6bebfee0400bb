//! Node-local shard handle with operation permits.
//!
//! The replication pipeline holds an operation permit for the whole span of
//! a primary or replica operation. The same semaphore backs primary-term
//! advancement and relocation hand-off, so a term bump or hand-off cannot
//! interleave with in-flight operations.

use crate::cluster::ShardRouting;
use crate::error::{Error, Result};
use crate::types::ShardId;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Total operation permits per shard. Term bumps and relocation hand-off
/// drain all of them.
const OPERATION_PERMITS: u32 = u32::MAX >> 2;

/// Engine-level state of a local shard copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexShardState {
    /// Created but not yet recovering.
    Created,
    /// Recovering from a peer or from local storage.
    Recovering,
    /// Serving operations.
    Started,
    /// Primary hand-off completed; this copy no longer coordinates writes.
    Relocated,
    /// Engine closed.
    Closed,
}

impl fmt::Display for IndexShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexShardState::Created => write!(f, "CREATED"),
            IndexShardState::Recovering => write!(f, "RECOVERING"),
            IndexShardState::Started => write!(f, "STARTED"),
            IndexShardState::Relocated => write!(f, "RELOCATED"),
            IndexShardState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Scoped hold on one operation permit of a shard.
///
/// Released on drop; `close` releases eagerly. Closing twice is swallowed
/// with a log line.
#[derive(Debug)]
pub struct OperationPermit {
    shard_id: ShardId,
    permit: Option<OwnedSemaphorePermit>,
}

impl OperationPermit {
    fn new(shard_id: ShardId, permit: OwnedSemaphorePermit) -> Self {
        Self {
            shard_id,
            permit: Some(permit),
        }
    }

    /// Release the permit.
    pub fn close(&mut self) {
        match self.permit.take() {
            Some(permit) => drop(permit),
            None => {
                tracing::debug!(shard_id = %self.shard_id, "operation permit closed twice");
            }
        }
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            tracing::trace!(shard_id = %self.shard_id, "releasing operation permit");
            drop(permit);
        }
    }
}

/// A node-local shard copy: routing identity, engine state, primary term,
/// and the operation-permit semaphore.
///
/// The storage engine behind the shard is out of scope here; domain
/// operations receive the shard handle and do their work under its permit.
#[derive(Debug)]
pub struct IndexShard {
    shard_id: ShardId,
    routing: RwLock<ShardRouting>,
    state: RwLock<IndexShardState>,
    primary_term: AtomicU64,
    permits: Arc<Semaphore>,
    failure: Mutex<Option<String>>,
}

impl IndexShard {
    /// Create a shard handle.
    pub fn new(routing: ShardRouting, state: IndexShardState, primary_term: u64) -> Self {
        Self {
            shard_id: routing.shard_id.clone(),
            routing: RwLock::new(routing),
            state: RwLock::new(state),
            primary_term: AtomicU64::new(primary_term),
            permits: Arc::new(Semaphore::new(OPERATION_PERMITS as usize)),
            failure: Mutex::new(None),
        }
    }

    /// The shard id.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// The current routing entry.
    pub fn routing_entry(&self) -> ShardRouting {
        self.routing.read().clone()
    }

    /// Replace the routing entry on cluster-state application.
    pub fn update_routing_entry(&self, routing: ShardRouting) {
        debug_assert_eq!(routing.shard_id, self.shard_id);
        *self.routing.write() = routing;
    }

    /// The engine state.
    pub fn state(&self) -> IndexShardState {
        *self.state.read()
    }

    /// Set the engine state.
    pub fn set_state(&self, state: IndexShardState) {
        *self.state.write() = state;
    }

    /// The primary term this shard operates under.
    pub fn primary_term(&self) -> u64 {
        self.primary_term.load(Ordering::Acquire)
    }

    /// Acquire the exclusive permit for a primary operation.
    ///
    /// Held for the span of the operation and its replication; while held,
    /// no other primary operation, term advancement, or relocation hand-off
    /// can interleave on this shard. Callers must have validated that this
    /// shard is the primary the request was aimed at.
    pub async fn acquire_primary_operation_permit(&self) -> Result<OperationPermit> {
        self.ensure_open()?;
        let permit = self
            .permits
            .clone()
            .acquire_many_owned(OPERATION_PERMITS)
            .await
            .map_err(|_| Error::ShardClosed {
                shard_id: self.shard_id.clone(),
            })?;
        Ok(OperationPermit::new(self.shard_id.clone(), permit))
    }

    /// Acquire a permit for a replica operation issued under `op_term`.
    ///
    /// A term older than the shard's own is refused; the master resolves the
    /// resulting failure by failing this copy. A newer term waits out every
    /// in-flight operation, advances the shard's view, and only then grants
    /// the permit.
    pub async fn acquire_replica_operation_permit(&self, op_term: u64) -> Result<OperationPermit> {
        self.ensure_open()?;
        let current = self.primary_term.load(Ordering::Acquire);
        if op_term < current {
            return Err(self.stale_term_error(op_term, current));
        }
        if op_term > current {
            let drained = self
                .permits
                .clone()
                .acquire_many_owned(OPERATION_PERMITS)
                .await
                .map_err(|_| Error::ShardClosed {
                    shard_id: self.shard_id.clone(),
                })?;
            let current = self.primary_term.load(Ordering::Acquire);
            if op_term > current {
                tracing::info!(
                    shard_id = %self.shard_id,
                    old_term = current,
                    new_term = op_term,
                    "detected new primary, advancing primary term"
                );
                self.primary_term.store(op_term, Ordering::Release);
            }
            drop(drained);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShardClosed {
                shard_id: self.shard_id.clone(),
            })?;
        // the term may have moved past us while we waited
        self.check_term_not_stale(op_term)?;
        Ok(OperationPermit::new(self.shard_id.clone(), permit))
    }

    /// Complete a primary relocation hand-off: drain every permit, then mark
    /// the shard relocated. In-flight operations finish first.
    pub async fn relocate_hand_off(&self) -> Result<()> {
        self.ensure_open()?;
        let all = self
            .permits
            .clone()
            .acquire_many_owned(OPERATION_PERMITS)
            .await
            .map_err(|_| Error::ShardClosed {
                shard_id: self.shard_id.clone(),
            })?;
        *self.state.write() = IndexShardState::Relocated;
        drop(all);
        tracing::info!(shard_id = %self.shard_id, "completed primary relocation hand-off");
        Ok(())
    }

    /// Mark the shard failed. The actual removal is the master's decision;
    /// this only records and logs the local failure.
    pub fn fail_shard(&self, reason: &str, cause: &Error) {
        tracing::error!(shard_id = %self.shard_id, reason, %cause, "failing shard");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(format!("{}: {}", reason, cause));
        }
    }

    /// Whether `fail_shard` has been called.
    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Number of operation permits currently held. An exclusive primary
    /// hold counts as all of them.
    pub fn active_operation_count(&self) -> usize {
        OPERATION_PERMITS as usize - self.permits.available_permits()
    }

    /// Whether any operation currently holds a permit.
    pub fn has_active_operations(&self) -> bool {
        self.active_operation_count() > 0
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == IndexShardState::Closed {
            return Err(Error::ShardClosed {
                shard_id: self.shard_id.clone(),
            });
        }
        Ok(())
    }

    fn check_term_not_stale(&self, op_term: u64) -> Result<()> {
        let current = self.primary_term.load(Ordering::Acquire);
        if op_term < current {
            return Err(self.stale_term_error(op_term, current));
        }
        Ok(())
    }

    fn stale_term_error(&self, op_term: u64, current: u64) -> Error {
        Error::IllegalShardState {
            shard_id: self.shard_id.clone(),
            reason: format!(
                "operation primary term [{}] is too old (current [{}])",
                op_term, current
            ),
        }
    }
}
