use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::SchedulerConfig;
use super::metrics::{ConcurrencyMetrics, MetricsState};
use super::task::{self, Job, Settle, TaskHandle, TaskId, TaskOutcome, TaskRecord};
use crate::config::ConfigError;
use crate::types::Backpressure;
use crate::waiter::{WaitGroup, WaitGuard};
use crate::{ErrorKind, Priority, Result};

/// Finished task records kept for [`TaskScheduler::task`]
const MAX_FINISHED_RECORDS: usize = 10_000;

/// Called with the record of every task that completed successfully
pub type CompletionCallback = Arc<dyn Fn(&TaskRecord) + Send + Sync>;

struct PendingTask {
    id: TaskId,
    token: CancellationToken,
    job: Job,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<Priority, VecDeque<PendingTask>>,
    running: HashMap<TaskId, CancellationToken>,
    records: HashMap<TaskId, TaskRecord>,
    finished: VecDeque<TaskId>,
}

impl State {
    fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    fn pending_by_priority(&self) -> BTreeMap<Priority, usize> {
        Priority::iter()
            .map(|priority| (priority, self.queues.get(&priority).map_or(0, VecDeque::len)))
            .collect()
    }

    /// Next task to start: the front of the highest non-empty priority, or
    /// the oldest task overall when priorities are ignored.
    fn pop_next(&mut self, by_priority: bool) -> Option<PendingTask> {
        let priority = if by_priority {
            self.queues
                .iter()
                .rev()
                .find(|(_, queue)| !queue.is_empty())
                .map(|(priority, _)| *priority)?
        } else {
            self.queues
                .iter()
                .filter_map(|(priority, queue)| queue.front().map(|task| (task.id, *priority)))
                .min()
                .map(|(_, priority)| priority)?
        };
        self.queues.get_mut(&priority)?.pop_front()
    }

    fn remove_pending(&mut self, id: TaskId) -> Option<PendingTask> {
        self.queues.values_mut().find_map(|queue| {
            let index = queue.iter().position(|task| task.id == id)?;
            queue.remove(index)
        })
    }

    fn remember_finished(&mut self, id: TaskId) {
        self.finished.push_back(id);
        while self.finished.len() > MAX_FINISHED_RECORDS {
            if let Some(evicted) = self.finished.pop_front() {
                self.records.remove(&evicted);
            }
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
    state: Mutex<State>,
    metrics: Mutex<MetricsState>,
    latest: Mutex<ConcurrencyMetrics>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    guard: Mutex<Option<WaitGuard>>,
    group: Mutex<Option<WaitGroup>>,
    shutdown: CancellationToken,
    on_complete: Option<CompletionCallback>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded-concurrency executor with priority queues.
///
/// Submissions are queued per [`Priority`] and started as slots free up.
/// Every task ends in exactly one of `Completed`, `Failed` or `Cancelled`,
/// and one task's failure or panic never affects the others.
///
/// Under sustained high-priority load, `Low` tasks may wait indefinitely:
/// there is no priority aging.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("config", &self.inner.config)
            .field("accepting", &self.inner.accepting.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    /// Create a scheduler.
    ///
    /// If a `metrics_interval` is configured and a tokio runtime is
    /// available, a background task refreshes [`Self::last_metrics`] on
    /// that period until [`Self::stop`].
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(config: SchedulerConfig) -> std::result::Result<Self, ConfigError> {
        Self::build(config, None)
    }

    /// Like [`Self::new`], invoking `callback` for every task that completes
    /// successfully. Failed and cancelled tasks do not trigger it.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn with_completion_callback(
        config: SchedulerConfig,
        callback: CompletionCallback,
    ) -> std::result::Result<Self, ConfigError> {
        Self::build(config, Some(callback))
    }

    fn build(
        config: SchedulerConfig,
        on_complete: Option<CompletionCallback>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let (group, guard) = WaitGroup::new();
        let scheduler = Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
                config,
                state: Mutex::new(State::default()),
                metrics: Mutex::new(MetricsState::default()),
                latest: Mutex::new(ConcurrencyMetrics::default()),
                next_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                guard: Mutex::new(Some(guard)),
                group: Mutex::new(Some(group)),
                shutdown: CancellationToken::new(),
                on_complete,
            }),
        };
        scheduler.spawn_metrics_tick();
        Ok(scheduler)
    }

    /// Configuration of this scheduler
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Queue `work` and return a handle to its result.
    ///
    /// `work` receives a token that is cancelled when the task gets
    /// cancelled; it should pass it on to any I/O it performs. The task
    /// fails with [`ErrorKind::Timeout`] after `timeout`, or the configured
    /// default.
    ///
    /// Never waits: a full queue is reported right away.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::BackpressureRejected`] if `max_pending_tasks`
    /// tasks are already queued and [`ErrorKind::ShuttingDown`] after
    /// [`Self::stop`] was called.
    pub fn submit<F, Fut, T>(
        &self,
        work: F,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<TaskHandle<T>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            return Err(ErrorKind::ShuttingDown);
        }

        let (sender, receiver) = oneshot::channel();
        let timeout = timeout.unwrap_or(inner.config.default_timeout);
        let id = TaskId(inner.next_id.fetch_add(1, Ordering::Relaxed));

        {
            let mut state = lock(&inner.state);
            let pending = state.pending();
            let capacity = inner.config.max_pending_tasks;
            if pending >= capacity {
                drop(state);
                lock(&inner.metrics).record_backpressure();
                log::warn!("Rejected {id}: {pending}/{capacity} tasks pending");
                return Err(ErrorKind::BackpressureRejected(Backpressure::Scheduler {
                    pending,
                    capacity,
                }));
            }

            state
                .records
                .insert(id, TaskRecord::new(id, priority, Instant::now()));
            state.queues.entry(priority).or_default().push_back(PendingTask {
                id,
                token: CancellationToken::new(),
                job: task::job(work, timeout, sender),
            });
            let mut metrics = lock(&inner.metrics);
            metrics.record_submitted();
            metrics.observe_concurrency(state.running.len(), pending + 1);
        }
        log::debug!("Queued {id} with priority {priority}");

        schedule(inner);
        Ok(TaskHandle::new(id, receiver))
    }

    /// Cancel a task. A pending task is removed from its queue, a running
    /// one gets its token cancelled and settles as `Cancelled`.
    ///
    /// Returns `false` if the task is unknown or already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = lock(&self.inner.state);
        if let Some(task) = state.remove_pending(id) {
            drop(state);
            self.inner.settle(id, &TaskOutcome::Cancelled);
            log::debug!("Cancelled pending {}", task.id);
            // dropping the job closes the handle's channel
            drop(task);
            return true;
        }
        if let Some(token) = state.running.get(&id) {
            token.cancel();
            log::debug!("Cancelling running {id}");
            return true;
        }
        false
    }

    /// Record of a task, while it is pending, running or recently finished
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<TaskRecord> {
        lock(&self.inner.state).records.get(&id).cloned()
    }

    /// Compute fresh metrics
    #[must_use]
    pub fn metrics(&self) -> ConcurrencyMetrics {
        self.inner.refresh_metrics()
    }

    /// Metrics as of the last completion or background refresh
    #[must_use]
    pub fn last_metrics(&self) -> ConcurrencyMetrics {
        lock(&self.inner.latest).clone()
    }

    /// Whether new submissions are still accepted
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting submissions, wait for every running task to finish,
    /// then cancel everything still queued. Running tasks are not
    /// interrupted. Calling it again is a no-op.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.cancel();
        log::info!("Stopping scheduler, waiting for running tasks");

        drop(lock(&inner.guard).take());
        let group = lock(&inner.group).take();
        if let Some(group) = group {
            group.wait().await;
        }

        let drained: Vec<PendingTask> = {
            let mut state = lock(&inner.state);
            state.queues.values_mut().flat_map(std::mem::take).collect()
        };
        let cancelled = drained.len();
        for task in drained {
            inner.settle(task.id, &TaskOutcome::Cancelled);
        }
        let metrics = inner.refresh_metrics();
        log::info!(
            "Scheduler stopped: {} completed, {} failed, {} cancelled ({cancelled} never started)",
            metrics.completed_tasks,
            metrics.failed_tasks,
            metrics.cancelled_tasks,
        );
    }

    fn spawn_metrics_tick(&self) {
        let Some(period) = self.inner.config.metrics_interval else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!("No runtime available, scheduler metrics refresh only on completion");
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.refresh_metrics();
                    }
                }
            }
        });
    }
}

impl Inner {
    /// Move a task into its final state, exactly once
    fn settle(&self, id: TaskId, outcome: &TaskOutcome) {
        let now = Instant::now();
        let record = {
            let mut state = lock(&self.state);
            state.running.remove(&id);
            let Some(record) = state.records.get_mut(&id) else {
                return;
            };
            if !record.settle(outcome, now) {
                return;
            }
            let record = record.clone();
            state.remember_finished(id);
            record
        };
        lock(&self.metrics).record_settled(&record, outcome, now);

        match outcome {
            TaskOutcome::Completed => {
                log::debug!("{id} completed");
                if let Some(callback) = &self.on_complete {
                    callback(&record);
                }
            }
            TaskOutcome::Failed(message) => log::debug!("{id} failed: {message}"),
            TaskOutcome::Cancelled => log::debug!("{id} cancelled"),
        }
        self.refresh_metrics();
    }

    fn refresh_metrics(&self) -> ConcurrencyMetrics {
        let (active, pending) = {
            let state = lock(&self.state);
            (state.running.len(), state.pending_by_priority())
        };
        let snapshot = {
            let mut metrics = lock(&self.metrics);
            metrics.prune(Instant::now());
            metrics.snapshot(active, pending)
        };
        lock(&self.latest).clone_from(&snapshot);
        snapshot
    }
}

/// Start queued tasks while slots are free. Runs on every submission and
/// after every finished task.
fn schedule(inner: &Arc<Inner>) {
    loop {
        if !inner.accepting.load(Ordering::Acquire) {
            return;
        }
        let Ok(permit) = Arc::clone(&inner.slots).try_acquire_owned() else {
            return;
        };
        let Some(guard) = lock(&inner.guard).clone() else {
            return;
        };

        let task = {
            let mut state = lock(&inner.state);
            let Some(task) = state.pop_next(inner.config.priority_scheduling) else {
                return;
            };
            let now = Instant::now();
            if let Some(record) = state.records.get_mut(&task.id) {
                record.start(now);
            }
            state.running.insert(task.id, task.token.clone());
            let pending = state.pending();
            lock(&inner.metrics).observe_concurrency(state.running.len(), pending);
            task
        };
        log::debug!("Starting {}", task.id);
        run(Arc::clone(inner), task, permit, guard);
    }
}

fn run(inner: Arc<Inner>, task: PendingTask, permit: OwnedSemaphorePermit, guard: WaitGuard) {
    let PendingTask { id, token, job } = task;
    let settle: Settle = {
        let inner = Arc::clone(&inner);
        Arc::new(move |outcome: TaskOutcome| inner.settle(id, &outcome))
    };
    tokio::spawn(async move {
        job(token, settle).await;
        drop(permit);
        drop(guard);
        schedule(&inner);
    });
}
