use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{ErrorKind, Priority, Result};

/// Identifier of a submitted task, unique per scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a task.
///
/// Transitions only go forward: `Pending -> Running -> {Completed, Failed, Cancelled}`,
/// or straight from `Pending` to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, waiting for a slot
    Pending,
    /// Holding a slot
    Running,
    /// Finished with a value
    Completed,
    /// Finished with an error, a timeout included
    Failed,
    /// Cancelled before or while running
    Cancelled,
}

impl TaskStatus {
    /// Whether this is a final state
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Bookkeeping the scheduler keeps about a task
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Task identifier
    pub id: TaskId,
    /// Priority it was submitted with
    pub priority: Priority,
    /// Current state
    pub status: TaskStatus,
    /// Submission time
    pub created_at: Instant,
    /// Time a slot was acquired, set at most once
    pub started_at: Option<Instant>,
    /// Time the task settled
    pub completed_at: Option<Instant>,
    /// Error message of failed tasks
    pub error: Option<String>,
}

impl TaskRecord {
    pub(crate) fn new(id: TaskId, priority: Priority, now: Instant) -> Self {
        Self {
            id,
            priority,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Time spent running, for tasks that started and settled
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        Some(self.completed_at?.saturating_duration_since(self.started_at?))
    }

    /// Time spent queued before a slot was acquired
    #[must_use]
    pub fn wait_time(&self) -> Option<Duration> {
        Some(self.started_at?.saturating_duration_since(self.created_at))
    }

    pub(crate) fn start(&mut self, now: Instant) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        true
    }

    pub(crate) fn settle(&mut self, outcome: &TaskOutcome, now: Instant) -> bool {
        if self.status.is_finished() {
            return false;
        }
        self.status = outcome.status();
        self.completed_at = Some(now);
        if let TaskOutcome::Failed(message) = outcome {
            self.error = Some(message.clone());
        }
        true
    }
}

/// How a task settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    pub(crate) fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(ErrorKind::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    pub(crate) const fn status(&self) -> TaskStatus {
        match self {
            Self::Completed => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Type-erased unit of work. It runs the user's future, settles the task
/// through `settle` and only then delivers the result to the handle.
pub(crate) type Job = Box<dyn FnOnce(CancellationToken, Settle) -> BoxFuture<'static, ()> + Send>;

/// Moves a task into its final state
pub(crate) type Settle = Arc<dyn Fn(TaskOutcome) + Send + Sync>;

/// Wrap `work` into a [`Job`] delivering into `sender`
pub(crate) fn job<F, Fut, T>(work: F, timeout: Duration, sender: oneshot::Sender<Result<T>>) -> Job
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    Box::new(move |token: CancellationToken, settle: Settle| {
        async move {
            let run = tokio::spawn(tokio::time::timeout(timeout, work(token.clone())));
            let abort = run.abort_handle();
            let result = tokio::select! {
                biased;
                () = token.cancelled() => {
                    abort.abort();
                    Err(ErrorKind::Cancelled)
                }
                joined = run => match joined {
                    Ok(Ok(result)) => result,
                    Ok(Err(_elapsed)) => Err(ErrorKind::Timeout(timeout)),
                    Err(e) => Err(ErrorKind::from(e)),
                },
            };
            settle(TaskOutcome::of(&result));
            // the caller may have dropped its handle
            let _ = sender.send(result);
        }
        .boxed()
    })
}

/// Resolves to the result of a submitted task.
///
/// Dropping the handle does not cancel the task; use
/// [`super::TaskScheduler::cancel`] for that.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: TaskId,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) const fn new(id: TaskId, receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self { id, receiver }
    }

    /// Identifier of the task
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ErrorKind::Cancelled)))
    }
}
