//! Aggregated request and challenge statistics.
//!
//! The [`Monitor`] is also the feedback path into adaptive rate limiting:
//! every outcome it records is passed on to the limiters of the affected
//! key, so adaptive limiters follow the real-world success rate.
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use http::StatusCode;

use crate::challenge::{ChallengeResult, ChallengeType};
use crate::ratelimit::{HostKey, RateLimiterPool};
use crate::window::{DEFAULT_WINDOW_SIZE, Window};

/// Percentiles of a latency distribution, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Number of samples in the rolling window
    pub samples: usize,
    /// Mean
    pub mean_ms: f64,
    /// Median
    pub p50_ms: f64,
    /// 95th percentile
    pub p95_ms: f64,
    /// 99th percentile
    pub p99_ms: f64,
    /// Largest sample
    pub max_ms: f64,
}

impl LatencySummary {
    fn of(window: &Window<f64>) -> Self {
        Self {
            samples: window.len(),
            mean_ms: window.mean(),
            p50_ms: window.percentile(50.0),
            p95_ms: window.percentile(95.0),
            p99_ms: window.percentile(99.0),
            max_ms: window.max(),
        }
    }
}

/// Counters of one challenge kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChallengeCounters {
    /// Responses classified as this kind
    pub detected: u64,
    /// Orchestration runs that got past it
    pub solved: u64,
    /// Orchestration runs that gave up
    pub failed: u64,
}

/// Snapshot of everything the [`Monitor`] recorded
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Requests that produced a final response or error
    pub total_requests: u64,
    /// Requests that ended with an unchallenged response
    pub successful_requests: u64,
    /// Requests that ended with an error or an unresolved challenge
    pub failed_requests: u64,
    /// Share of successful requests, `0.0` before the first request
    pub success_rate: f64,
    /// Responses per status code, resubmissions included
    pub status_codes: BTreeMap<u16, u64>,
    /// Transport round-trip times
    pub response_time: LatencySummary,
    /// Per-kind challenge counters
    pub challenges: BTreeMap<ChallengeType, ChallengeCounters>,
    /// Wall time of successful orchestration runs
    pub solve_time: LatencySummary,
    /// Time since the monitor was created
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

#[derive(Debug)]
struct State {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    status_codes: BTreeMap<u16, u64>,
    response_times: Window<f64>,
    challenges: BTreeMap<ChallengeType, ChallengeCounters>,
    solve_times: Window<f64>,
}

/// Collects request and challenge outcomes and feeds them back into the
/// rate limiters.
#[derive(Debug)]
pub struct Monitor {
    state: Mutex<State>,
    limiters: Arc<RateLimiterPool>,
    started: Instant,
}

impl Monitor {
    /// Create a monitor reporting outcomes to `limiters`
    #[must_use]
    pub fn new(limiters: Arc<RateLimiterPool>) -> Self {
        Self::with_window(limiters, DEFAULT_WINDOW_SIZE)
    }

    /// Like [`Monitor::new`], keeping at most `window` latency samples
    #[must_use]
    pub fn with_window(limiters: Arc<RateLimiterPool>, window: usize) -> Self {
        Self {
            state: Mutex::new(State {
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                status_codes: BTreeMap::new(),
                response_times: Window::new(window),
                challenges: BTreeMap::new(),
                solve_times: Window::new(window),
            }),
            limiters,
            started: Instant::now(),
        }
    }

    /// Record one transport round trip
    pub fn record_response(&self, status: StatusCode, elapsed: Duration) {
        let mut state = self.lock();
        *state.status_codes.entry(status.as_u16()).or_default() += 1;
        state.response_times.push(millis(elapsed));
    }

    /// Record that a response was classified as `challenge_type`
    pub fn record_detection(&self, challenge_type: ChallengeType) {
        if !challenge_type.is_challenge() {
            return;
        }
        self.lock()
            .challenges
            .entry(challenge_type)
            .or_default()
            .detected += 1;
    }

    /// Record the terminal result of one orchestration run and adapt the
    /// limiters of `key` to it
    pub fn record_challenge(&self, key: &HostKey, result: &ChallengeResult) {
        if !result.challenge_type.is_challenge() {
            return;
        }
        {
            let mut state = self.lock();
            let counters = state.challenges.entry(result.challenge_type).or_default();
            if result.success {
                counters.solved += 1;
                state.solve_times.push(millis(result.total_time));
            } else {
                counters.failed += 1;
            }
        }
        if result.success {
            log::info!(
                "Solved {} challenge for {key} after {} attempt(s)",
                result.challenge_type,
                result.attempts
            );
        }
        self.feed_back(key, result.success);
    }

    /// Record how a whole request ended
    ///
    /// Requests that went through a challenge have already been fed back
    /// by [`Monitor::record_challenge`], so `challenged` skips the limiter
    /// feedback for them.
    pub fn record_outcome(&self, key: &HostKey, success: bool, challenged: bool) {
        {
            let mut state = self.lock();
            state.total_requests += 1;
            if success {
                state.successful_requests += 1;
            } else {
                state.failed_requests += 1;
            }
        }
        if !challenged {
            self.feed_back(key, success);
        }
    }

    /// Record a request dropped before it ended, by its timeout or a
    /// cancellation, as failed.
    ///
    /// A cancellation says nothing about the host, so only a timed out
    /// request is fed back, and only if no challenge run did so already.
    pub fn record_interrupted(&self, key: &HostKey, challenged: bool, cancelled: bool) {
        log::warn!(
            "Request to {key} was {} before it finished",
            if cancelled { "cancelled" } else { "interrupted" }
        );
        self.record_outcome(key, false, challenged || cancelled);
    }

    /// Record a challenge run dropped before it ended as failed. Like
    /// [`Monitor::record_interrupted`], a cancellation is not fed back.
    pub fn record_interrupted_challenge(
        &self,
        key: &HostKey,
        challenge_type: ChallengeType,
        cancelled: bool,
    ) {
        if !challenge_type.is_challenge() {
            return;
        }
        self.lock()
            .challenges
            .entry(challenge_type)
            .or_default()
            .failed += 1;
        if !cancelled {
            self.feed_back(key, false);
        }
    }

    /// Current snapshot of all statistics
    #[must_use]
    pub fn metrics(&self) -> PerformanceMetrics {
        let state = self.lock();
        #[allow(clippy::cast_precision_loss)]
        let success_rate = if state.total_requests == 0 {
            0.0
        } else {
            state.successful_requests as f64 / state.total_requests as f64
        };
        PerformanceMetrics {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            success_rate,
            status_codes: state.status_codes.clone(),
            response_time: LatencySummary::of(&state.response_times),
            challenges: state.challenges.clone(),
            solve_time: LatencySummary::of(&state.solve_times),
            uptime: self.started.elapsed(),
        }
    }

    fn feed_back(&self, key: &HostKey, success: bool) {
        if success {
            self.limiters.record_success(key);
        } else {
            self.limiters.record_failure(key);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
