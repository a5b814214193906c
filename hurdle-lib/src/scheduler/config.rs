use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ConfigError;

/// Configuration of a [`super::TaskScheduler`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Tasks running at the same time
    pub max_concurrent_tasks: usize,
    /// Tasks allowed to wait for a slot; further submissions are rejected
    pub max_pending_tasks: usize,
    /// Timeout of tasks submitted without their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Pop the highest priority first; plain FIFO across priorities otherwise
    pub priority_scheduling: bool,
    /// Period of the background metrics refresh
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_pending_tasks: 1000,
            default_timeout: crate::types::DEFAULT_REQUEST_TIMEOUT,
            priority_scheduling: true,
            metrics_interval: None,
        }
    }
}

impl SchedulerConfig {
    /// Check every parameter for its valid range
    ///
    /// # Errors
    ///
    /// Returns the first parameter found out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::out_of_range(
                "max_concurrent_requests",
                "must be at least 1",
            ));
        }
        if self.max_pending_tasks == 0 {
            return Err(ConfigError::out_of_range(
                "max_pending_requests",
                "must be at least 1",
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::out_of_range("request_timeout", "must not be zero"));
        }
        if self.metrics_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::out_of_range("metrics_interval", "must not be zero"));
        }
        Ok(())
    }
}
