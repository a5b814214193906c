use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

use crate::config::ConfigError;

/// Default admitted requests per second
const DEFAULT_RATE: f64 = 10.0;
/// Default burst capacity
const DEFAULT_BURST: u32 = 10;
/// Default lower bound for the adaptive rate
const DEFAULT_MIN_RATE: f64 = 1.0;
/// Default upper bound for the adaptive rate
const DEFAULT_MAX_RATE: f64 = 100.0;
/// Default number of callers allowed to wait on one limiter
const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
/// Default cap for backpressure delays
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
/// Default first delay of the `Delay` strategy
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
/// Default growth factor of the `Delay` strategy
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
/// Default window of the sliding-window algorithm
const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(1);
/// Default period between two adaptive rate adjustments
const DEFAULT_ADAPTATION_WINDOW: Duration = Duration::from_secs(10);

/// The admission algorithm of a rate limiter
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Algorithm {
    /// Continuous refill at `rate` up to `burst` tokens
    #[default]
    TokenBucket,
    /// A queue draining at `rate`, holding at most `burst` items
    LeakyBucket,
    /// At most `rate * window_size` admissions in any window
    SlidingWindow,
    /// Token bucket whose rate follows the observed success rate
    Adaptive,
}

/// What a rate limiter does when admission is denied
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BackpressureStrategy {
    /// Poll until admitted, without an upper bound on the wait.
    /// Only meant for trusted internal callers.
    Block,
    /// Reject immediately
    Drop,
    /// Retry with exponential backoff, then reject
    #[default]
    Delay,
    /// Wait once, longer when the queue is fuller and the caller less important
    AdaptiveDelay,
}

/// Configuration of a single rate limiter.
///
/// Immutable once the limiter is built; only the adaptive algorithm
/// changes its effective rate at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Admitted units per second
    pub rate: f64,
    /// Burst capacity (token bucket size, leaky bucket length)
    pub burst: u32,
    /// Admission algorithm
    pub algorithm: Algorithm,
    /// Policy applied on denial
    pub backpressure: BackpressureStrategy,
    /// Lower bound of the adaptive rate
    pub min_rate: f64,
    /// Upper bound of the adaptive rate
    pub max_rate: f64,
    /// Maximum number of callers waiting on this limiter
    pub max_queue_size: usize,
    /// Upper bound of any single backpressure delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// First delay of the `Delay` strategy
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Growth factor between two `Delay` retries
    pub backoff_factor: f64,
    /// Window of the sliding-window algorithm
    #[serde(with = "humantime_serde")]
    pub window_size: Duration,
    /// Period between two adaptive rate adjustments
    #[serde(with = "humantime_serde")]
    pub adaptation_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            burst: DEFAULT_BURST,
            algorithm: Algorithm::default(),
            backpressure: BackpressureStrategy::default(),
            min_rate: DEFAULT_MIN_RATE,
            max_rate: DEFAULT_MAX_RATE,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_delay: DEFAULT_MAX_DELAY,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            window_size: DEFAULT_WINDOW_SIZE,
            adaptation_window: DEFAULT_ADAPTATION_WINDOW,
        }
    }
}

impl RateLimitConfig {
    /// A config admitting `rate` per second with a burst of the same size
    #[must_use]
    pub fn per_second(rate: f64) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let burst = rate.ceil().max(1.0) as u32;
        Self {
            rate,
            burst,
            ..Self::default()
        }
    }

    /// Check every parameter for its valid range
    ///
    /// # Errors
    ///
    /// Returns the first parameter found out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(ConfigError::out_of_range("rate", "must be a positive number"));
        }
        if self.burst == 0 {
            return Err(ConfigError::out_of_range("burst", "must be at least 1"));
        }
        if !(self.min_rate.is_finite() && self.min_rate > 0.0) {
            return Err(ConfigError::out_of_range("min_rate", "must be a positive number"));
        }
        if !self.max_rate.is_finite() || self.min_rate > self.max_rate {
            return Err(ConfigError::out_of_range(
                "max_rate",
                format!("must be at least min_rate ({})", self.min_rate),
            ));
        }
        if self.algorithm == Algorithm::Adaptive
            && (self.rate < self.min_rate || self.rate > self.max_rate)
        {
            return Err(ConfigError::out_of_range(
                "rate",
                format!(
                    "must lie within [{}, {}] for the adaptive algorithm",
                    self.min_rate, self.max_rate
                ),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::out_of_range("max_queue_size", "must be at least 1"));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(ConfigError::out_of_range("backoff_factor", "must be at least 1.0"));
        }
        if self.window_size.is_zero() {
            return Err(ConfigError::out_of_range("window_size", "must not be zero"));
        }
        if self.algorithm == Algorithm::SlidingWindow
            && self.rate * self.window_size.as_secs_f64() <= 0.0
        {
            return Err(ConfigError::out_of_range(
                "window_size",
                "rate * window_size must be positive",
            ));
        }
        if self.adaptation_window.is_zero() {
            return Err(ConfigError::out_of_range("adaptation_window", "must not be zero"));
        }
        Ok(())
    }
}
