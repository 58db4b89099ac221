//! Configuration types for the migration backend and worker.

use std::time::Duration;

/// Configuration for the migration backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Interval between work cycles when no event wakes the loop earlier.
    pub poll_interval: Duration,

    /// How long to wait before re-querying a node whose status RPC failed.
    pub retry_backoff: Duration,

    /// Timeout applied to each outgoing status RPC.
    pub rpc_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

impl BackendConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the work-cycle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-node retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the status RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

/// Configuration for the partition-work worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Timeout applied to each partition work attempt. An elapsed attempt
    /// fails with a retryable timeout.
    pub operation_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config_builders() {
        let config = BackendConfig::new()
            .with_poll_interval(Duration::from_millis(20))
            .with_retry_backoff(Duration::from_millis(50))
            .with_rpc_timeout(Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.retry_backoff, Duration::from_millis(50));
        assert_eq!(config.rpc_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::new().with_operation_timeout(Duration::from_secs(2));
        assert_eq!(config.operation_timeout, Duration::from_secs(2));
    }
}
