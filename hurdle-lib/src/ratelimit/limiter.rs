use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use super::algorithm::{self, RateAlgorithm};
use super::config::{Algorithm, BackpressureStrategy, RateLimitConfig};
use crate::config::ConfigError;
use crate::types::Backpressure;
use crate::{ErrorKind, Priority, Result};

/// Retries of the `Delay` strategy before the request is dropped
const MAX_DELAY_ATTEMPTS: u32 = 10;

/// Pause between two polls of the `Block` strategy
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counters of a [`RateLimiter`]
#[derive(Debug, Default)]
struct LimiterStats {
    admitted: AtomicU64,
    denied: AtomicU64,
    dropped: AtomicU64,
    delayed: AtomicU64,
    blocked: AtomicU64,
    queue_rejections: AtomicU64,
    total_wait_micros: AtomicU64,
}

/// Point-in-time view of a [`RateLimiter`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Key of the limiter
    pub key: String,
    /// Admission algorithm
    pub algorithm: Algorithm,
    /// Backpressure strategy
    pub strategy: BackpressureStrategy,
    /// Rate currently enforced, in units per second
    pub current_rate: f64,
    /// How saturated the algorithm is, from 0.0 to 1.0
    pub utilization: f64,
    /// Requests admitted, immediately or after waiting
    pub admitted: u64,
    /// Individual admission checks that were denied
    pub denied: u64,
    /// Requests given up by the backpressure strategy
    pub dropped: u64,
    /// Requests admitted after a `Delay`/`AdaptiveDelay` wait
    pub delayed: u64,
    /// Requests admitted after a `Block` wait
    pub blocked: u64,
    /// Requests rejected because too many callers were waiting
    pub queue_rejections: u64,
    /// Callers currently waiting for admission
    pub waiting: usize,
    /// Admitted requests not yet released
    pub in_flight: usize,
    /// Mean backpressure wait of requests that eventually got admitted
    pub average_wait_ms: f64,
}

/// A rate limiter combining an admission algorithm with a backpressure
/// strategy that only comes into play when admission is denied.
#[derive(Debug)]
pub struct RateLimiter {
    key: String,
    config: RateLimitConfig,
    algorithm: Box<dyn RateAlgorithm>,
    waiting: AtomicUsize,
    in_flight: AtomicUsize,
    stats: LimiterStats,
}

/// Holds a place in a limiter's wait queue
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RateLimiter {
    /// Create a limiter identified by `key`
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(key: impl Into<String>, config: RateLimitConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_validated(key, config))
    }

    pub(crate) fn with_validated(key: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            key: key.into(),
            algorithm: algorithm::build(&config),
            config,
            waiting: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            stats: LimiterStats::default(),
        }
    }

    /// Key of this limiter
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Configuration of this limiter
    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Evaluate the algorithm once, without any backpressure.
    ///
    /// An admitted request counts as in flight until [`Self::release`].
    pub fn try_acquire(&self, cost: u32) -> bool {
        if self.algorithm.try_acquire(cost) {
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            self.in_flight.fetch_add(cost as usize, Ordering::AcqRel);
            true
        } else {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Acquire admission for `cost` units, applying the backpressure
    /// strategy if the algorithm denies it.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BackpressureRejected`] when the strategy gives
    /// up or the wait queue is full. The `Block` strategy never gives up.
    pub async fn acquire(&self, cost: u32, priority: Priority) -> Result<()> {
        if self.try_acquire(cost) {
            return Ok(());
        }

        match self.config.backpressure {
            BackpressureStrategy::Drop => {
                log::debug!("Rate limiter `{}` dropped a request", self.key);
                Err(self.drop_request())
            }
            BackpressureStrategy::Block => {
                let _slot = self.enter_queue()?;
                let start = Instant::now();
                loop {
                    sleep(BLOCK_POLL_INTERVAL).await;
                    if self.try_acquire(cost) {
                        self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                        self.record_wait(start.elapsed());
                        return Ok(());
                    }
                }
            }
            BackpressureStrategy::Delay => {
                let _slot = self.enter_queue()?;
                let start = Instant::now();
                let mut delay = self.config.initial_delay.min(self.config.max_delay);
                for attempt in 1..=MAX_DELAY_ATTEMPTS {
                    sleep(delay).await;
                    if self.try_acquire(cost) {
                        log::debug!(
                            "Rate limiter `{}` admitted a request after {attempt} delayed attempt(s)",
                            self.key
                        );
                        self.stats.delayed.fetch_add(1, Ordering::Relaxed);
                        self.record_wait(start.elapsed());
                        return Ok(());
                    }
                    delay = delay
                        .mul_f64(self.config.backoff_factor)
                        .min(self.config.max_delay);
                }
                log::warn!(
                    "Rate limiter `{}` dropped a request after {MAX_DELAY_ATTEMPTS} delayed attempts",
                    self.key
                );
                Err(self.drop_request())
            }
            BackpressureStrategy::AdaptiveDelay => {
                let ratio = self.queue_ratio();
                let _slot = self.enter_queue()?;
                let delay = adaptive_delay(ratio, priority).min(self.config.max_delay);
                let start = Instant::now();
                sleep(delay).await;
                if self.try_acquire(cost) {
                    self.stats.delayed.fetch_add(1, Ordering::Relaxed);
                    self.record_wait(start.elapsed());
                    Ok(())
                } else {
                    log::warn!(
                        "Rate limiter `{}` dropped a request after an adaptive delay of {}ms",
                        self.key,
                        delay.as_millis()
                    );
                    Err(self.drop_request())
                }
            }
        }
    }

    /// Mark `cost` previously admitted units as finished
    pub fn release(&self, cost: u32) {
        let cost = cost as usize;
        // saturating: a release without matching acquire must not wrap
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(cost))
            });
    }

    /// Report a successful request; only affects adaptive limiters
    pub fn record_success(&self) {
        self.algorithm.record_outcome_at(true, Instant::now());
    }

    /// Report a failed request; only affects adaptive limiters
    pub fn record_failure(&self) {
        self.algorithm.record_outcome_at(false, Instant::now());
    }

    /// Rate currently enforced, in units per second
    #[must_use]
    pub fn current_rate(&self) -> f64 {
        self.algorithm.current_rate()
    }

    /// Fraction of the wait queue that is occupied
    #[must_use]
    pub fn queue_ratio(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.waiting.load(Ordering::Acquire) as f64 / self.config.max_queue_size as f64;
        ratio.min(1.0)
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn status(&self) -> RateLimitStatus {
        let delayed = self.stats.delayed.load(Ordering::Relaxed);
        let blocked = self.stats.blocked.load(Ordering::Relaxed);
        let waited = delayed + blocked;
        #[allow(clippy::cast_precision_loss)]
        let average_wait_ms = if waited == 0 {
            0.0
        } else {
            self.stats.total_wait_micros.load(Ordering::Relaxed) as f64 / waited as f64 / 1000.0
        };

        RateLimitStatus {
            key: self.key.clone(),
            algorithm: self.config.algorithm,
            strategy: self.config.backpressure,
            current_rate: self.current_rate(),
            utilization: self.algorithm.utilization_at(Instant::now()),
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            delayed,
            blocked,
            queue_rejections: self.stats.queue_rejections.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Acquire),
            in_flight: self.in_flight.load(Ordering::Acquire),
            average_wait_ms,
        }
    }

    fn enter_queue(&self) -> Result<QueueSlot<'_>> {
        let capacity = self.config.max_queue_size;
        let entered = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < capacity).then_some(waiting + 1)
            });
        match entered {
            Ok(_) => Ok(QueueSlot(&self.waiting)),
            Err(_) => {
                self.stats.queue_rejections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rate limiter `{}` queue is full ({capacity} waiting)", self.key);
                Err(ErrorKind::BackpressureRejected(
                    Backpressure::LimiterQueueFull {
                        key: self.key.clone(),
                        capacity,
                    },
                ))
            }
        }
    }

    fn drop_request(&self) -> ErrorKind {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        ErrorKind::BackpressureRejected(Backpressure::RateLimiter {
            key: self.key.clone(),
            strategy: self.config.backpressure,
        })
    }

    fn record_wait(&self, waited: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let micros = waited.as_micros() as u64;
        self.stats
            .total_wait_micros
            .fetch_add(micros, Ordering::Relaxed);
    }
}

/// Delay of the `AdaptiveDelay` strategy: longer when the queue is fuller,
/// shorter for more important callers.
fn adaptive_delay(queue_ratio: f64, priority: Priority) -> Duration {
    let base = 0.1 + 2.0 * queue_ratio;
    let priority_factor = (1.0 - f64::from(priority.weight()) * 0.1).max(0.1);
    Duration::from_secs_f64(base * priority_factor)
}
