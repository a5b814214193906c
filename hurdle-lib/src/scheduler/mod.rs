//! Bounded-concurrency task scheduling.
//!
//! [`TaskScheduler`] queues work per [`Priority`](crate::Priority), runs at
//! most `max_concurrent_tasks` of it at once and rejects submissions
//! outright once `max_pending_tasks` are waiting.

mod config;
mod metrics;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;

pub use config::SchedulerConfig;
pub use metrics::ConcurrencyMetrics;
pub use scheduler::{CompletionCallback, TaskScheduler};
pub use task::{TaskHandle, TaskId, TaskRecord, TaskStatus};
