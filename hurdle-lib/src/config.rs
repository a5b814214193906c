//! Client configuration.
//!
//! [`ClientConfig`] is the single flat surface users fill in (from code or
//! a TOML file). Every component derives its own config from it and
//! validates it once, at construction.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::challenge::{OrchestratorConfig, SolverConfig};
use crate::ratelimit::{Algorithm, BackpressureStrategy, RateLimitConfig};
use crate::scheduler::SchedulerConfig;

const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;
const DEFAULT_MAX_PENDING_REQUESTS: usize = 1000;
const DEFAULT_REQUEST_TIMEOUT: Duration = crate::types::DEFAULT_REQUEST_TIMEOUT;
const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;
const DEFAULT_GLOBAL_REQUESTS_PER_SECOND: f64 = 100.0;
const DEFAULT_MAX_CHALLENGE_ATTEMPTS: u32 = 3;
const DEFAULT_CHALLENGE_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_CHALLENGE_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_CHALLENGE_BACKOFF_FACTOR: f64 = 2.0;
/// Pre-solve delay of JavaScript challenges, matching the usual 4s page timer
const DEFAULT_CHALLENGE_DELAY: Duration = Duration::from_secs(4);
const DEFAULT_RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(60);
const DEFAULT_JS_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A parameter is outside of its valid range
    #[error("`{field}` {reason}")]
    OutOfRange {
        /// Name of the offending option
        field: &'static str,
        /// What the valid range is
        reason: String,
    },

    /// The configuration file is not valid TOML or has unknown keys
    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration file could not be read
    #[error("Cannot read configuration file `{}`: {source}", path.display())]
    Read {
        /// Path of the file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn out_of_range(field: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field,
            reason: reason.into(),
        }
    }
}

/// Every option recognized by a [`Client`](crate::Client)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Requests executed at the same time
    pub max_concurrent_requests: usize,
    /// Requests allowed to wait for a free slot before submissions are rejected
    pub max_pending_requests: usize,
    /// Timeout of one request including challenge handling
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Run higher priorities first instead of plain FIFO
    pub priority_scheduling: bool,

    /// Admitted requests per second and host
    pub requests_per_second: f64,
    /// Burst capacity per host, defaults to `requests_per_second` rounded up
    pub burst: Option<u32>,
    /// Admitted requests per second across all hosts
    pub global_requests_per_second: f64,
    /// Admission algorithm
    pub rate_algorithm: Algorithm,
    /// What to do when a request is not admitted
    pub backpressure_strategy: BackpressureStrategy,
    /// Lower bound of the adaptive rate
    pub min_rate: f64,
    /// Upper bound of the adaptive rate
    pub max_rate: f64,
    /// Callers allowed to wait on one rate limiter
    pub max_queue_size: usize,
    /// Upper bound of a single backpressure delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor of the `delay` backpressure strategy
    pub backoff_factor: f64,
    /// Window of the sliding-window algorithm
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,
    /// Period between two adaptive rate adjustments
    #[serde(with = "humantime_serde")]
    pub adaptation_window: Duration,

    /// Solve attempts per challenged request
    pub max_challenge_attempts: u32,
    /// First backoff between two failed attempts
    #[serde(with = "humantime_serde")]
    pub challenge_base_delay: Duration,
    /// Upper bound of the backoff between two attempts
    #[serde(with = "humantime_serde")]
    pub challenge_max_delay: Duration,
    /// Growth factor of the backoff between two attempts
    pub challenge_backoff_factor: f64,
    /// Wait before submitting a JavaScript challenge answer, unless the
    /// page declares its own
    #[serde(with = "humantime_serde")]
    pub challenge_delay: Duration,
    /// Solve JavaScript challenges
    pub solve_javascript: bool,
    /// Attempt managed challenges
    pub solve_managed: bool,
    /// Attempt Turnstile challenges
    pub solve_turnstile: bool,
    /// Wait out rate-limit responses and retry
    pub handle_rate_limits: bool,
    /// Wait used for rate-limit responses without `Retry-After`
    #[serde(with = "humantime_serde")]
    pub rate_limit_base_delay: Duration,
    /// Upper bound of a rate-limit wait
    #[serde(with = "humantime_serde")]
    pub rate_limit_max_wait: Duration,
    /// Timeout of one JavaScript evaluation
    #[serde(with = "humantime_serde")]
    pub js_timeout: Duration,

    /// Period of the background metrics refresh, zero disables it
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
    /// User agent sent by the default fingerprint provider
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let rate_limit = RateLimitConfig::default();
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            priority_scheduling: true,
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: None,
            global_requests_per_second: DEFAULT_GLOBAL_REQUESTS_PER_SECOND,
            rate_algorithm: rate_limit.algorithm,
            backpressure_strategy: rate_limit.backpressure,
            min_rate: rate_limit.min_rate,
            max_rate: rate_limit.max_rate,
            max_queue_size: rate_limit.max_queue_size,
            max_delay: rate_limit.max_delay,
            backoff_factor: rate_limit.backoff_factor,
            window_size: rate_limit.window_size,
            adaptation_window: rate_limit.adaptation_window,
            max_challenge_attempts: DEFAULT_MAX_CHALLENGE_ATTEMPTS,
            challenge_base_delay: DEFAULT_CHALLENGE_BASE_DELAY,
            challenge_max_delay: DEFAULT_CHALLENGE_MAX_DELAY,
            challenge_backoff_factor: DEFAULT_CHALLENGE_BACKOFF_FACTOR,
            challenge_delay: DEFAULT_CHALLENGE_DELAY,
            solve_javascript: true,
            solve_managed: false,
            solve_turnstile: false,
            handle_rate_limits: true,
            rate_limit_base_delay: DEFAULT_RATE_LIMIT_BASE_DELAY,
            rate_limit_max_wait: DEFAULT_RATE_LIMIT_MAX_WAIT,
            js_timeout: DEFAULT_JS_TIMEOUT,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            user_agent: None,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid TOML, unknown keys, or values that fail
    /// [`Self::validate`].
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, or for the reasons
    /// listed in [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check every option, including those of the derived component configs
    ///
    /// # Errors
    ///
    /// Returns the first option found out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_challenge_attempts == 0 {
            return Err(ConfigError::out_of_range(
                "max_challenge_attempts",
                "must be at least 1",
            ));
        }
        if self.burst == Some(0) {
            return Err(ConfigError::out_of_range("burst", "must be at least 1"));
        }
        self.scheduler_config().validate()?;
        self.rate_limit_config()
            .validate()
            .map_err(|e| rename_field(e, "rate", "requests_per_second"))?;
        self.global_rate_limit_config()
            .validate()
            .map_err(|e| rename_field(e, "rate", "global_requests_per_second"))?;
        self.solver_config().validate()?;
        self.orchestrator_config().validate()
    }

    /// Limit applied to each host
    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let defaults = RateLimitConfig::per_second(self.requests_per_second);
        RateLimitConfig {
            rate: self.requests_per_second,
            burst: self.burst.unwrap_or(defaults.burst),
            algorithm: self.rate_algorithm,
            backpressure: self.backpressure_strategy,
            min_rate: self.min_rate,
            max_rate: self.max_rate,
            max_queue_size: self.max_queue_size,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            window_size: self.window_size,
            adaptation_window: self.adaptation_window,
            ..defaults
        }
    }

    /// Limit shared by all hosts. Always a token bucket; the adaptive
    /// behavior only applies per host.
    #[must_use]
    pub fn global_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            backpressure: self.backpressure_strategy,
            max_queue_size: self.max_queue_size.max(self.max_pending_requests),
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            max_rate: self.global_requests_per_second.max(self.max_rate),
            min_rate: self.min_rate.min(self.global_requests_per_second),
            ..RateLimitConfig::per_second(self.global_requests_per_second)
        }
    }

    /// Scheduler part of this config
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_tasks: self.max_concurrent_requests,
            max_pending_tasks: self.max_pending_requests,
            default_timeout: self.request_timeout,
            priority_scheduling: self.priority_scheduling,
            metrics_interval: (!self.metrics_interval.is_zero()).then_some(self.metrics_interval),
        }
    }

    /// Solver part of this config
    #[must_use]
    pub fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            solve_javascript: self.solve_javascript,
            solve_managed: self.solve_managed,
            solve_turnstile: self.solve_turnstile,
            handle_rate_limits: self.handle_rate_limits,
            rate_limit_base_delay: self.rate_limit_base_delay,
            rate_limit_max_wait: self.rate_limit_max_wait,
            js_timeout: self.js_timeout,
        }
    }

    /// Orchestrator part of this config
    #[must_use]
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_attempts: self.max_challenge_attempts,
            base_delay: self.challenge_base_delay,
            max_delay: self.challenge_max_delay,
            backoff_factor: self.challenge_backoff_factor,
            challenge_delay: self.challenge_delay,
        }
    }
}

/// Report derived fields under the name the user actually configured
fn rename_field(error: ConfigError, from: &'static str, to: &'static str) -> ConfigError {
    match error {
        ConfigError::OutOfRange { field, reason } if field == from => {
            ConfigError::OutOfRange { field: to, reason }
        }
        other => other,
    }
}
