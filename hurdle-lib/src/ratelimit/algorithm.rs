//! Admission algorithms.
//!
//! Every algorithm answers one question synchronously, without I/O:
//! may `cost` units pass at instant `now`? Backpressure is layered on top
//! by [`super::RateLimiter`].
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::config::{Algorithm, RateLimitConfig};

/// Tolerance for floating point token accounting
const EPSILON: f64 = 1e-9;

/// Success rate above which the adaptive rate grows
const INCREASE_THRESHOLD: f64 = 0.95;
/// Success rate below which the adaptive rate shrinks
const DECREASE_THRESHOLD: f64 = 0.8;
const INCREASE_FACTOR: f64 = 1.1;
const DECREASE_FACTOR: f64 = 0.9;

/// Common contract of all admission algorithms
pub trait RateAlgorithm: Send + Sync + std::fmt::Debug {
    /// Try to admit `cost` units at `now`, consuming capacity on success
    fn try_acquire_at(&self, cost: u32, now: Instant) -> bool;

    /// Try to admit `cost` units right now
    fn try_acquire(&self, cost: u32) -> bool {
        self.try_acquire_at(cost, Instant::now())
    }

    /// The rate currently enforced, in units per second
    fn current_rate(&self) -> f64;

    /// How full the limiter is at `now`, from 0.0 (idle) to 1.0 (saturated)
    fn utilization_at(&self, now: Instant) -> f64;

    /// Feed the outcome of an admitted request back into the algorithm.
    /// Only the adaptive algorithm reacts to it.
    fn record_outcome_at(&self, _success: bool, _now: Instant) {}
}

/// Build the algorithm selected by `config`
#[must_use]
pub fn build(config: &RateLimitConfig) -> Box<dyn RateAlgorithm> {
    match config.algorithm {
        Algorithm::TokenBucket => Box::new(TokenBucket::new(config.rate, config.burst)),
        Algorithm::LeakyBucket => Box::new(LeakyBucket::new(config.rate, config.burst)),
        Algorithm::SlidingWindow => Box::new(SlidingWindow::new(config.rate, config.window_size)),
        Algorithm::Adaptive => Box::new(AdaptiveRate::new(config)),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        0.0
    } else {
        (part / whole).clamp(0.0, 1.0)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Tokens refill continuously at `rate` per second up to `burst`.
/// The bucket starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        let capacity = f64::from(burst);
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Change the refill rate; tokens accrued so far use the old rate
    pub fn set_rate_at(&self, rate: f64, now: Instant) {
        let mut state = lock(&self.state);
        state.refill(now, self.capacity);
        state.rate = rate;
    }

    /// Tokens available at `now`
    pub fn available_at(&self, now: Instant) -> f64 {
        let mut state = lock(&self.state);
        state.refill(now, self.capacity);
        state.tokens
    }
}

impl RateAlgorithm for TokenBucket {
    fn try_acquire_at(&self, cost: u32, now: Instant) -> bool {
        let mut state = lock(&self.state);
        state.refill(now, self.capacity);
        let cost = f64::from(cost);
        if state.tokens + EPSILON >= cost {
            state.tokens = (state.tokens - cost).max(0.0);
            true
        } else {
            false
        }
    }

    fn current_rate(&self) -> f64 {
        lock(&self.state).rate
    }

    fn utilization_at(&self, now: Instant) -> f64 {
        1.0 - ratio(self.available_at(now), self.capacity)
    }
}

#[derive(Debug)]
struct LeakState {
    queued: u64,
    last_leak: Instant,
}

/// A FIFO queue of at most `burst` items that leaks `rate` items per second.
#[derive(Debug)]
pub struct LeakyBucket {
    rate: f64,
    capacity: u64,
    state: Mutex<LeakState>,
}

impl LeakyBucket {
    /// Create an empty bucket
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            capacity: u64::from(burst),
            state: Mutex::new(LeakState {
                queued: 0,
                last_leak: Instant::now(),
            }),
        }
    }

    fn leak(&self, state: &mut LeakState, now: Instant) {
        if state.queued == 0 {
            state.last_leak = state.last_leak.max(now);
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_leak).as_secs_f64();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let leaked = (elapsed * self.rate + EPSILON).floor() as u64;
        if leaked == 0 {
            return;
        }
        if leaked >= state.queued {
            state.queued = 0;
            state.last_leak = now;
        } else {
            state.queued -= leaked;
            // keep the fractional remainder for the next leak
            #[allow(clippy::cast_precision_loss)]
            let consumed = Duration::from_secs_f64(leaked as f64 / self.rate);
            state.last_leak += consumed;
        }
    }
}

impl RateAlgorithm for LeakyBucket {
    fn try_acquire_at(&self, cost: u32, now: Instant) -> bool {
        let mut state = lock(&self.state);
        self.leak(&mut state, now);
        let cost = u64::from(cost);
        if state.queued + cost <= self.capacity {
            if state.queued == 0 {
                state.last_leak = now.max(state.last_leak);
            }
            state.queued += cost;
            true
        } else {
            false
        }
    }

    fn current_rate(&self) -> f64 {
        self.rate
    }

    #[allow(clippy::cast_precision_loss)]
    fn utilization_at(&self, now: Instant) -> f64 {
        let mut state = lock(&self.state);
        self.leak(&mut state, now);
        ratio(state.queued as f64, self.capacity as f64)
    }
}

/// Admits a call while fewer than `rate * window_size` calls were admitted
/// within the trailing window.
#[derive(Debug)]
pub struct SlidingWindow {
    rate: f64,
    window: Duration,
    limit: usize,
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    /// Create an empty window
    #[must_use]
    pub fn new(rate: f64, window: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit = (rate * window.as_secs_f64() - EPSILON).ceil().max(1.0) as usize;
        Self {
            rate,
            window,
            limit,
            admitted: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    fn evict(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = admitted.front() {
            if oldest + self.window <= now {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateAlgorithm for SlidingWindow {
    fn try_acquire_at(&self, cost: u32, now: Instant) -> bool {
        let mut admitted = lock(&self.admitted);
        self.evict(&mut admitted, now);
        let cost = cost as usize;
        if admitted.len() + cost <= self.limit {
            admitted.extend(std::iter::repeat_n(now, cost));
            true
        } else {
            false
        }
    }

    fn current_rate(&self) -> f64 {
        self.rate
    }

    #[allow(clippy::cast_precision_loss)]
    fn utilization_at(&self, now: Instant) -> f64 {
        let mut admitted = lock(&self.admitted);
        self.evict(&mut admitted, now);
        ratio(admitted.len() as f64, self.limit as f64)
    }
}

#[derive(Debug)]
struct AdaptiveState {
    current_rate: f64,
    successes: u64,
    failures: u64,
    window_start: Instant,
}

/// A token bucket whose rate follows the observed success rate.
///
/// At the first admission or outcome after each `adaptation_window`, a
/// success rate above 95% grows the rate by 10% and one below 80% shrinks
/// it by 10%, always within `[min_rate, max_rate]`. Counters then reset.
/// Adjustments happen lazily on those calls, not on a timer.
#[derive(Debug)]
pub struct AdaptiveRate {
    bucket: TokenBucket,
    min_rate: f64,
    max_rate: f64,
    adaptation_window: Duration,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveRate {
    /// Create an adaptive limiter starting at `config.rate`
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let rate = config.rate.clamp(config.min_rate, config.max_rate);
        Self {
            bucket: TokenBucket::new(rate, config.burst),
            min_rate: config.min_rate,
            max_rate: config.max_rate,
            adaptation_window: config.adaptation_window,
            state: Mutex::new(AdaptiveState {
                current_rate: rate,
                successes: 0,
                failures: 0,
                window_start: Instant::now(),
            }),
        }
    }

    fn maybe_adapt(&self, now: Instant) {
        let mut state = lock(&self.state);
        if now.saturating_duration_since(state.window_start) < self.adaptation_window {
            return;
        }

        let total = state.successes + state.failures;
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let success_rate = state.successes as f64 / total as f64;
            let previous = state.current_rate;
            if success_rate > INCREASE_THRESHOLD {
                state.current_rate = (previous * INCREASE_FACTOR).min(self.max_rate);
            } else if success_rate < DECREASE_THRESHOLD {
                state.current_rate = (previous * DECREASE_FACTOR).max(self.min_rate);
            }
            if (state.current_rate - previous).abs() > EPSILON {
                log::debug!(
                    "Adaptive rate changed from {previous:.2}/s to {:.2}/s (success rate {:.0}%)",
                    state.current_rate,
                    success_rate * 100.0
                );
                self.bucket.set_rate_at(state.current_rate, now);
            }
        }

        state.successes = 0;
        state.failures = 0;
        state.window_start = now;
    }
}

impl RateAlgorithm for AdaptiveRate {
    fn try_acquire_at(&self, cost: u32, now: Instant) -> bool {
        self.maybe_adapt(now);
        self.bucket.try_acquire_at(cost, now)
    }

    fn current_rate(&self) -> f64 {
        lock(&self.state).current_rate
    }

    fn utilization_at(&self, now: Instant) -> f64 {
        self.bucket.utilization_at(now)
    }

    fn record_outcome_at(&self, success: bool, now: Instant) {
        {
            let mut state = lock(&self.state);
            if success {
                state.successes += 1;
            } else {
                state.failures += 1;
            }
        }
        self.maybe_adapt(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_token_bucket_burst_then_deny() {
        let bucket = TokenBucket::new(10.0, 5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(bucket.try_acquire_at(1, now));
        }
        assert!(!bucket.try_acquire_at(1, now));
    }

    #[test]
    fn test_token_bucket_steady_state_never_denies() {
        let bucket = TokenBucket::new(10.0, 3);
        let start = Instant::now();
        // drain the burst
        for _ in 0..3 {
            assert!(bucket.try_acquire_at(1, start));
        }
        // one call every 1/rate seconds must always pass
        for i in 1..=200 {
            assert!(bucket.try_acquire_at(1, start + ms(100 * i)), "denied at call {i}");
        }
    }

    #[test]
    fn test_token_bucket_refill_is_capped() {
        let bucket = TokenBucket::new(100.0, 4);
        let start = Instant::now();
        assert!(bucket.try_acquire_at(4, start));
        let later = start + Duration::from_secs(60);
        assert!((bucket.available_at(later) - 4.0).abs() < EPSILON);
        assert!(!bucket.try_acquire_at(5, later));
    }

    #[test]
    fn test_leaky_bucket_leaks_over_time() {
        let bucket = LeakyBucket::new(2.0, 2);
        let start = Instant::now();
        assert!(bucket.try_acquire_at(1, start));
        assert!(bucket.try_acquire_at(1, start));
        assert!(!bucket.try_acquire_at(1, start));
        // one item leaks after 500ms
        assert!(!bucket.try_acquire_at(1, start + ms(400)));
        assert!(bucket.try_acquire_at(1, start + ms(500)));
        assert!(!bucket.try_acquire_at(1, start + ms(500)));
        assert!((bucket.utilization_at(start + ms(500)) - 1.0).abs() < EPSILON);
        assert!(bucket.utilization_at(start + Duration::from_secs(5)).abs() < EPSILON);
    }

    #[test]
    fn test_sliding_window_limit() {
        let window = SlidingWindow::new(5.0, Duration::from_secs(1));
        let start = Instant::now();
        for i in 0..5 {
            assert!(window.try_acquire_at(1, start + ms(i * 10)));
        }
        assert!(!window.try_acquire_at(1, start + ms(500)));
        // the first admission leaves the window at start + 1s
        assert!(window.try_acquire_at(1, start + ms(1000)));
        assert!(!window.try_acquire_at(1, start + ms(1005)));
    }

    #[test]
    fn test_sliding_window_fractional_limit() {
        // counts 0, 1 and 2 are below 2.5
        let window = SlidingWindow::new(2.5, Duration::from_secs(1));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(window.try_acquire_at(1, now));
        }
        assert!(!window.try_acquire_at(1, now));

        let window = SlidingWindow::new(0.5, Duration::from_secs(1));
        assert!(window.try_acquire_at(1, now));
        assert!(!window.try_acquire_at(1, now));
    }

    #[test]
    fn test_sliding_window_cost_counts_multiple() {
        let window = SlidingWindow::new(4.0, Duration::from_secs(1));
        let now = Instant::now();
        assert!(window.try_acquire_at(3, now));
        assert!(!window.try_acquire_at(2, now));
        assert!(window.try_acquire_at(1, now));
    }

    fn adaptive(rate: f64) -> AdaptiveRate {
        AdaptiveRate::new(&RateLimitConfig {
            algorithm: Algorithm::Adaptive,
            rate,
            burst: 10,
            min_rate: 2.0,
            max_rate: 12.0,
            adaptation_window: Duration::from_secs(1),
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_adaptive_increases_on_success() {
        let limiter = adaptive(10.0);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.record_outcome_at(true, start);
        }
        limiter.record_outcome_at(true, start + Duration::from_secs(1));
        assert!((limiter.current_rate() - 11.0).abs() < 1e-6);

        for _ in 0..20 {
            limiter.record_outcome_at(true, start + Duration::from_secs(1));
        }
        limiter.record_outcome_at(true, start + Duration::from_secs(2));
        // capped at max_rate
        assert!((limiter.current_rate() - 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_decreases_on_failure() {
        let limiter = adaptive(10.0);
        let start = Instant::now();
        for i in 0..10 {
            limiter.record_outcome_at(i % 2 == 0, start);
        }
        assert!(limiter.try_acquire_at(1, start + Duration::from_secs(1)));
        assert!((limiter.current_rate() - 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_holds_between_thresholds() {
        let limiter = adaptive(10.0);
        let start = Instant::now();
        for i in 0..10 {
            // 90% success
            limiter.record_outcome_at(i != 0, start);
        }
        limiter.record_outcome_at(true, start + Duration::from_secs(1));
        assert!((limiter.current_rate() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_adaptive_rate_stays_within_bounds() {
        let limiter = adaptive(5.0);
        let mut now = Instant::now();
        // a fixed pseudo random pattern of good and bad windows
        let pattern = [true, false, false, true, true, true, false, true, false, false];
        for round in 0..200 {
            let succeed = pattern[round % pattern.len()];
            for _ in 0..10 {
                limiter.record_outcome_at(succeed, now);
            }
            now += Duration::from_secs(1);
            limiter.record_outcome_at(succeed, now);
            let rate = limiter.current_rate();
            assert!((2.0..=12.0).contains(&rate), "rate {rate} out of bounds");
        }
    }
}
