use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;

use crate::challenge::{ChallengeResult, ChallengeType, SolverError, UnsupportedReason};
use crate::config::ConfigError;
use crate::ratelimit::BackpressureStrategy;
use crate::transport::TransportError;

/// Possible errors when issuing requests through `hurdle_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A queue was full and the configured backpressure policy gave up
    #[error("Request rejected by backpressure: {0}")]
    BackpressureRejected(Backpressure),

    /// A task exceeded its execution timeout
    #[error("Task exceeded its timeout of {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The transport collaborator failed to perform a request
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The response carried a challenge that cannot be solved automatically
    #[error("Challenge `{0}` cannot be solved: {1}")]
    UnsolvableChallenge(ChallengeType, UnsupportedReason),

    /// The JS evaluator or the fallback interpreter failed
    #[error("Failed to solve challenge: {0}")]
    Solver(#[from] SolverError),

    /// A challenge was detected but every attempt to resolve it failed
    #[error(
        "Challenge `{}` unresolved after {} attempt(s)",
        .0.challenge_type,
        .0.attempts
    )]
    ChallengeUnresolved(Box<ChallengeResult>),

    /// Parameters were out of range when a component was constructed
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The task was cancelled before it could settle
    #[error("Task was cancelled")]
    Cancelled,

    /// The scheduler no longer accepts new submissions
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// The task panicked or its runtime handle failed
    #[error("Task failed unexpectedly: {0}")]
    TaskFailed(String),

    /// An URL without a host was passed where a host is required
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The given string could not be parsed as an URL
    #[error("Cannot parse URL: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Where a request was turned away and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backpressure {
    /// The scheduler's pending queue reached its capacity
    Scheduler {
        /// Tasks pending at the time of the rejection
        pending: usize,
        /// Configured `max_pending_tasks`
        capacity: usize,
    },
    /// A rate limiter denied admission and its strategy gave up
    RateLimiter {
        /// Limiter key, `global` for the shared limiter
        key: String,
        /// Strategy that was applied on denial
        strategy: BackpressureStrategy,
    },
    /// Too many callers were already waiting on a rate limiter
    LimiterQueueFull {
        /// Limiter key, `global` for the shared limiter
        key: String,
        /// Configured `max_queue_size`
        capacity: usize,
    },
}

impl std::fmt::Display for Backpressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler { pending, capacity } => {
                write!(f, "scheduler queue full ({pending}/{capacity} pending)")
            }
            Self::RateLimiter { key, strategy } => {
                write!(f, "rate limit for `{key}` exceeded (strategy: {strategy})")
            }
            Self::LimiterQueueFull { key, capacity } => {
                write!(f, "rate limiter queue for `{key}` full ({capacity} waiting)")
            }
        }
    }
}

impl ErrorKind {
    /// Returns `true` if this error came out of a backpressure decision
    #[must_use]
    pub const fn is_backpressure(&self) -> bool {
        matches!(self, Self::BackpressureRejected(_))
    }

    /// Return the underlying transport error, if any
    #[must_use]
    pub const fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<tokio::task::JoinError> for ErrorKind {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::TaskFailed(e.to_string())
    }
}
