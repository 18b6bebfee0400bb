//! Cluster-state publication and observation.
//!
//! [`ClusterService`] is the node-local holder of the latest applied cluster
//! state. The replication pipeline never mutates it; it subscribes through
//! [`ClusterStateObserver`] and re-runs when a new state arrives.

use super::state::ClusterState;
use crate::types::NodeId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct Published {
    state: Arc<ClusterState>,
    closed: bool,
}

/// Node-local cluster-state service.
#[derive(Debug)]
pub struct ClusterService {
    local_node_id: NodeId,
    tx: watch::Sender<Published>,
}

impl ClusterService {
    /// Create a service for `local_node_id` seeded with an initial state.
    pub fn new(local_node_id: NodeId, initial: ClusterState) -> Self {
        let (tx, _rx) = watch::channel(Published {
            state: Arc::new(initial),
            closed: false,
        });
        Self { local_node_id, tx }
    }

    /// Id of this node.
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// The latest applied state.
    pub fn state(&self) -> Arc<ClusterState> {
        self.tx.borrow().state.clone()
    }

    /// Apply a new state. Waiting observers are woken.
    pub fn publish(&self, state: ClusterState) {
        tracing::debug!(
            node_id = self.local_node_id,
            version = state.version,
            "applying new cluster state"
        );
        self.tx.send_modify(|p| p.state = Arc::new(state));
    }

    /// Close the service. All pending observers resolve with
    /// [`ObservedChange::Closed`].
    pub fn close(&self) {
        self.tx.send_modify(|p| p.closed = true);
    }

    /// Whether the service has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.borrow().closed
    }

    /// Create an observer bounded by `timeout`. `None` waits indefinitely;
    /// zero means "do not wait at all".
    pub fn observer(&self, timeout: Option<Duration>) -> ClusterStateObserver {
        ClusterStateObserver {
            rx: self.tx.subscribe(),
            deadline: timeout.map(|t| Instant::now() + t),
            timed_out: false,
        }
    }
}

/// Outcome of waiting for a cluster-state change.
#[derive(Debug, Clone)]
pub enum ObservedChange {
    /// A new state was applied.
    NewState(Arc<ClusterState>),
    /// The observer's overall timeout elapsed before a change arrived.
    Timeout,
    /// The cluster service shut down.
    Closed,
}

/// A bounded subscription to cluster-state changes.
///
/// `observed_state` marks the current state as seen; a subsequent
/// `wait_for_next_change` resolves only for states published after that
/// point, so a publish racing with the caller is never lost.
#[derive(Debug)]
pub struct ClusterStateObserver {
    rx: watch::Receiver<Published>,
    deadline: Option<Instant>,
    timed_out: bool,
}

impl ClusterStateObserver {
    /// The latest state, marked as seen.
    pub fn observed_state(&mut self) -> Arc<ClusterState> {
        self.rx.borrow_and_update().state.clone()
    }

    /// Whether the overall timeout has elapsed. Once true, callers should
    /// treat further failures as terminal.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Wait until a state newer than the last observed one is applied, the
    /// observer times out, or the service closes.
    pub async fn wait_for_next_change(&mut self) -> ObservedChange {
        if self.rx.borrow().closed {
            return ObservedChange::Closed;
        }
        let remaining = match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    self.timed_out = true;
                    return ObservedChange::Timeout;
                }
                Some(deadline - now)
            }
            None => None,
        };

        let changed = self.rx.changed();
        let outcome = match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, changed).await {
                Ok(result) => result,
                Err(_) => {
                    self.timed_out = true;
                    return ObservedChange::Timeout;
                }
            },
            None => changed.await,
        };

        match outcome {
            Ok(()) => {
                let published = self.rx.borrow_and_update();
                if published.closed {
                    ObservedChange::Closed
                } else {
                    ObservedChange::NewState(published.state.clone())
                }
            }
            // sender dropped: the service is gone
            Err(_) => ObservedChange::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(version: u64) -> ClusterState {
        ClusterState::builder(version).build()
    }

    #[tokio::test]
    async fn test_observer_sees_new_state() {
        let service = Arc::new(ClusterService::new(1, state(1)));
        let mut observer = service.observer(None);
        assert_eq!(observer.observed_state().version, 1);

        let publisher = service.clone();
        let handle = tokio::spawn(async move {
            publisher.publish(state(2));
        });

        match observer.wait_for_next_change().await {
            ObservedChange::NewState(s) => assert_eq!(s.version, 2),
            other => panic!("unexpected: {:?}", other),
        }
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_observer_does_not_miss_racing_publish() {
        let service = ClusterService::new(1, state(1));
        let mut observer = service.observer(None);
        observer.observed_state();

        // published before the wait starts
        service.publish(state(2));

        match observer.wait_for_next_change().await {
            ObservedChange::NewState(s) => assert_eq!(s.version, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_observer_zero_timeout_fires_immediately() {
        let service = ClusterService::new(1, state(1));
        let mut observer = service.observer(Some(Duration::ZERO));
        assert!(!observer.is_timed_out());
        assert!(matches!(
            observer.wait_for_next_change().await,
            ObservedChange::Timeout
        ));
        assert!(observer.is_timed_out());
    }

    #[tokio::test]
    async fn test_observer_close_wakes_waiters() {
        let service = Arc::new(ClusterService::new(1, state(1)));
        let mut observer = service.observer(None);
        observer.observed_state();

        let closer = service.clone();
        tokio::spawn(async move {
            closer.close();
        });

        assert!(matches!(
            observer.wait_for_next_change().await,
            ObservedChange::Closed
        ));
    }

    #[tokio::test]
    async fn test_observer_timeout_elapses() {
        let service = ClusterService::new(1, state(1));
        let mut observer = service.observer(Some(Duration::from_millis(20)));
        assert!(matches!(
            observer.wait_for_next_change().await,
            ObservedChange::Timeout
        ));
    }
}
