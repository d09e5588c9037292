//! Reconciliation pipeline configuration.

use std::time::Duration;

use thiserror::Error;

/// Invalid pipeline configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Pipeline configuration.
///
/// Built once at startup and handed to the controller; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll the store for unreconciled orders
    pub poll_interval: Duration,
    /// Capacity of the bounded work queue between poller and workers
    pub queue_capacity: usize,
    /// Maximum concurrent reconciliation attempts
    pub max_concurrent: usize,
    /// Upper bound for a single accrual query
    pub request_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            name: "accrual-reconciler".to_string(),
            poll_interval: Duration::from_secs(10),
            queue_capacity: 10,
            max_concurrent: 8,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Zero("max_concurrent"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request_timeout"));
        }
        Ok(())
    }
}
