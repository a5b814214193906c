use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::task::{TaskOutcome, TaskRecord};
use crate::Priority;
use crate::window::Window;

/// Period over which throughput is measured
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Number of task durations the rolling average is computed over
const DURATION_SAMPLES: usize = 1000;

/// Snapshot of a scheduler's state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConcurrencyMetrics {
    /// Tasks holding a slot
    pub active_tasks: usize,
    /// Tasks waiting for a slot
    pub pending_tasks: usize,
    /// Pending tasks per priority
    pub pending_by_priority: BTreeMap<Priority, usize>,
    /// Accepted submissions
    pub total_submitted: u64,
    /// Tasks that finished with a value
    pub completed_tasks: u64,
    /// Tasks that finished with an error or timed out
    pub failed_tasks: u64,
    /// Tasks cancelled before or while running
    pub cancelled_tasks: u64,
    /// Submissions rejected because the pending queue was full
    pub backpressure_events: u64,
    /// Highest `active + pending` ever observed
    pub peak_concurrency: usize,
    /// Rolling average run time of finished tasks
    pub average_duration_ms: f64,
    /// Tasks finished per second over the last minute
    pub throughput_per_second: f64,
}

impl ConcurrencyMetrics {
    /// Tasks in a final state. Never exceeds `total_submitted`.
    #[must_use]
    pub const fn finished_tasks(&self) -> u64 {
        self.completed_tasks + self.failed_tasks + self.cancelled_tasks
    }
}

/// Accumulated history behind [`ConcurrencyMetrics`]
#[derive(Debug)]
pub(crate) struct MetricsState {
    total_submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    backpressure_events: u64,
    peak_concurrency: usize,
    durations: Window<f64>,
    finished_at: VecDeque<Instant>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self {
            total_submitted: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            backpressure_events: 0,
            peak_concurrency: 0,
            durations: Window::new(DURATION_SAMPLES),
            finished_at: VecDeque::new(),
        }
    }
}

impl MetricsState {
    pub(crate) fn record_submitted(&mut self) {
        self.total_submitted += 1;
    }

    pub(crate) fn record_backpressure(&mut self) {
        self.backpressure_events += 1;
    }

    pub(crate) fn observe_concurrency(&mut self, active: usize, pending: usize) {
        self.peak_concurrency = self.peak_concurrency.max(active + pending);
    }

    pub(crate) fn record_settled(&mut self, record: &TaskRecord, outcome: &TaskOutcome, now: Instant) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::Cancelled => self.cancelled += 1,
        }
        if let Some(duration) = record.duration() {
            self.durations.push(duration.as_secs_f64() * 1000.0);
        }
        self.finished_at.push_back(now);
        self.prune(now);
    }

    /// Forget completions that left the throughput window
    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.finished_at.front() {
            if now.saturating_duration_since(oldest) <= THROUGHPUT_WINDOW {
                break;
            }
            self.finished_at.pop_front();
        }
    }

    pub(crate) fn snapshot(
        &self,
        active_tasks: usize,
        pending_by_priority: BTreeMap<Priority, usize>,
    ) -> ConcurrencyMetrics {
        let pending_tasks = pending_by_priority.values().sum();
        #[allow(clippy::cast_precision_loss)]
        let throughput_per_second = self.finished_at.len() as f64 / THROUGHPUT_WINDOW.as_secs_f64();
        ConcurrencyMetrics {
            active_tasks,
            pending_tasks,
            pending_by_priority,
            total_submitted: self.total_submitted,
            completed_tasks: self.completed,
            failed_tasks: self.failed,
            cancelled_tasks: self.cancelled,
            backpressure_events: self.backpressure_events,
            peak_concurrency: self.peak_concurrency,
            average_duration_ms: self.durations.mean(),
            throughput_per_second,
        }
    }
}
