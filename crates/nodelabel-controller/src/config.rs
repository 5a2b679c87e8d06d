//! Controller configuration.

use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry policy applied by the controller to retryable reconcile errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry (in milliseconds).
    pub base_delay_ms: u64,
    /// Upper bound for the exponential delay (in milliseconds).
    pub max_delay_ms: u64,
    /// Attempts per node before giving up until the next resync.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Configuration for the controller driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
    /// Timeout for each node store operation (in milliseconds).
    pub operation_timeout_ms: u64,
    /// How often every node is re-enqueued (in milliseconds, 0 disables).
    pub resync_interval_ms: u64,
    /// How often the compatibility source is polled (in milliseconds, 0 disables).
    pub config_poll_interval_ms: u64,
    /// Capacity of the controller event channel.
    pub event_capacity: usize,
    /// Retry policy for retryable reconcile errors.
    pub retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            operation_timeout_ms: 10_000,
            resync_interval_ms: 600_000,
            config_poll_interval_ms: 10_000,
            event_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .map_err(|e| ControllerError::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&raw)
            .map_err(|e| ControllerError::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ControllerError::InvalidConfig(
                "operation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ControllerError::InvalidConfig(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ControllerError::InvalidConfig(
                "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_ms > 0).then(|| Duration::from_millis(self.resync_interval_ms))
    }

    pub fn config_poll_interval(&self) -> Option<Duration> {
        (self.config_poll_interval_ms > 0)
            .then(|| Duration::from_millis(self.config_poll_interval_ms))
    }
}

/// Builder for controller configuration.
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn operation_timeout(mut self, ms: u64) -> Self {
        self.config.operation_timeout_ms = ms;
        self
    }

    pub fn resync_interval(mut self, ms: u64) -> Self {
        self.config.resync_interval_ms = ms;
        self
    }

    pub fn config_poll_interval(mut self, ms: u64) -> Self {
        self.config.config_poll_interval_ms = ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn retry(mut self, base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        self.config.retry = RetryPolicy {
            base_delay_ms,
            max_delay_ms,
            max_attempts,
        };
        self
    }

    pub fn build(self) -> ControllerConfig {
        self.config
    }
}

impl Default for ControllerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
