use std::io;

use crate::ErrorKind;
use crate::transport::TransportError;

/// An extension trait to help determine if a failed challenge attempt
/// may be retried.
///
/// Transient network failures and solver errors are retried, up to the
/// attempt cap. Anything that would fail the same way again is not.
pub(crate) trait RetryExt {
    fn should_retry(&self) -> bool;
}

impl RetryExt for reqwest::Error {
    #[allow(clippy::if_same_then_else)]
    fn should_retry(&self) -> bool {
        if self.is_timeout() {
            true
        } else if self.is_body() || self.is_decode() || self.is_builder() || self.is_redirect() {
            false
        } else if self.is_request() || self.is_connect() {
            // Connections cut halfway through surface as an io error
            // somewhere down the source chain.
            get_source_error_type::<io::Error>(self).is_some_and(should_retry_io)
        } else {
            false
        }
    }
}

impl RetryExt for TransportError {
    #[allow(clippy::match_same_arms)]
    fn should_retry(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Connect(_) => true,
            Self::Tls(_) => false,
            Self::Request(e) | Self::ReadBody(e) => e.should_retry(),
            Self::Client(_) => false,
            Self::Cancelled => false,
        }
    }
}

impl RetryExt for ErrorKind {
    #[allow(clippy::match_same_arms)]
    fn should_retry(&self) -> bool {
        match self {
            Self::Transport(e) => e.should_retry(),
            Self::Solver(_) => true,
            Self::Timeout(_) => true,
            Self::UnsolvableChallenge(..) => false,
            Self::BackpressureRejected(_) => false,
            Self::Config(_) => false,
            _ => false,
        }
    }
}

/// Classifies an `io::Error` into retryable or not.
fn should_retry_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Downcasts the given err source into T.
fn get_source_error_type<T: std::error::Error + 'static>(
    err: &dyn std::error::Error,
) -> Option<&T> {
    let mut source = err.source();

    while let Some(err) = source {
        if let Some(found) = err.downcast_ref::<T>() {
            return Some(found);
        }

        source = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::challenge::{ChallengeType, SolverError, UnsupportedReason};
    use crate::config::ConfigError;
    use crate::types::Backpressure;

    #[test]
    fn test_should_retry() {
        assert!(ErrorKind::Transport(TransportError::Timeout).should_retry());
        assert!(ErrorKind::Transport(TransportError::Connect("reset".into())).should_retry());
        assert!(ErrorKind::Solver(SolverError::MissingScript).should_retry());
        assert!(ErrorKind::Timeout(Duration::from_secs(1)).should_retry());

        assert!(!ErrorKind::Transport(TransportError::Cancelled).should_retry());
        assert!(!ErrorKind::Transport(TransportError::Tls("bad certificate".into())).should_retry());
        assert!(
            !ErrorKind::UnsolvableChallenge(ChallengeType::Turnstile, UnsupportedReason::Disabled)
                .should_retry()
        );
        assert!(
            !ErrorKind::BackpressureRejected(Backpressure::Scheduler {
                pending: 1,
                capacity: 1
            })
            .should_retry()
        );
        assert!(!ErrorKind::Config(ConfigError::out_of_range("burst", "must be positive")).should_retry());
        assert!(!ErrorKind::Cancelled.should_retry());
    }

    #[test]
    fn test_io_classification() {
        assert!(should_retry_io(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!should_retry_io(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
