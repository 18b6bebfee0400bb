//! Per-action configuration.

use std::time::Duration;

/// Delivery priority hint for an action's RPCs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RpcPriority {
    /// Ordinary traffic.
    #[default]
    Normal,
    /// Jump ahead of queued ordinary traffic, e.g. cluster-critical writes.
    Urgent,
}

/// Options applied to the RPCs an action sends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportOptions {
    /// RPC timeout; `None` inherits the transport default.
    pub timeout: Option<Duration>,
    /// Priority hint for the transport's send queues.
    pub priority: RpcPriority,
}

impl TransportOptions {
    /// Options with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the RPC timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the priority hint.
    pub fn with_priority(mut self, priority: RpcPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Configuration for one replication action.
///
/// The action name derives the names of the three RPC endpoints: the
/// reroute endpoint uses the name itself, the primary and replica endpoints
/// append `[p]` and `[r]`.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    /// Logical action name, e.g. `indices:data/write/index`.
    pub name: String,

    /// Name of the pool primary and replica operations run on.
    pub executor: String,

    /// RPC options for the action's outbound requests.
    pub transport_options: TransportOptions,
}

impl ActionConfig {
    /// Create a config for the named action with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor: "generic".to_string(),
            transport_options: TransportOptions::default(),
        }
    }

    /// Set the executor pool name.
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    /// Set the transport options.
    pub fn with_transport_options(mut self, options: TransportOptions) -> Self {
        self.transport_options = options;
        self
    }

    /// Name of the primary-side RPC endpoint.
    pub fn primary_action_name(&self) -> String {
        format!("{}[p]", self.name)
    }

    /// Name of the replica-side RPC endpoint.
    pub fn replica_action_name(&self) -> String {
        format!("{}[r]", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_names() {
        let config = ActionConfig::new("indices:data/write/index");
        assert_eq!(config.primary_action_name(), "indices:data/write/index[p]");
        assert_eq!(config.replica_action_name(), "indices:data/write/index[r]");
    }

    #[test]
    fn test_builder() {
        let config = ActionConfig::new("test")
            .with_executor("index")
            .with_transport_options(TransportOptions::new().with_timeout(Duration::from_secs(1)));
        assert_eq!(config.executor, "index");
        assert_eq!(
            config.transport_options.timeout,
            Some(Duration::from_secs(1))
        );
    }
}
