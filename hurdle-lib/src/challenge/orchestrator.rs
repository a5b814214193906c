use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::solver::{ChallengeSolver, Solution, SolverError};
use super::{ChallengeDetector, ChallengeInfo, ChallengeResult, ChallengeType};
use crate::config::ConfigError;
use crate::dispatch::Dispatcher;
use crate::monitor::Monitor;
use crate::ratelimit::HostKey;
use crate::retry::RetryExt;
use crate::transport::RequestContext;
use crate::types::{HttpRequest, HttpResponse, Priority};
use crate::{ErrorKind, Result};

/// Relative jitter of the pre-solve delay
const PRESOLVE_JITTER: f64 = 0.2;
/// Relative jitter of the backoff between attempts
const BACKOFF_JITTER: f64 = 0.5;

/// Attempt and timing limits of a [`ChallengeOrchestrator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Solve attempts per challenged request
    pub max_attempts: u32,
    /// Backoff after the first failed attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound of the backoff and of the delay a challenge page
    /// declares, before jitter
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth of the backoff per failed attempt
    pub backoff_factor: f64,
    /// Wait before answering a JavaScript challenge that declares no delay
    #[serde(with = "humantime_serde")]
    pub challenge_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            challenge_delay: Duration::from_secs(4),
        }
    }
}

impl OrchestratorConfig {
    /// Check every parameter for its valid range
    ///
    /// # Errors
    ///
    /// Returns the first parameter found out of range.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::out_of_range("max_challenge_attempts", "must be at least 1"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::out_of_range(
                "challenge_backoff_factor",
                format!("must be at least 1, got {}", self.backoff_factor),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::out_of_range(
                "challenge_base_delay",
                "must not exceed challenge_max_delay",
            ));
        }
        Ok(())
    }

    /// Backoff after failed attempt number `attempt` (1-based), without jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.powi(exponent);
        if !factor.is_finite() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// How a challenged request ended
#[derive(Debug)]
pub struct Resolution {
    /// The last response received, the unchallenged one on success
    pub response: HttpResponse,
    /// Outcome of the orchestration run
    pub result: ChallengeResult,
}

/// Drives a challenged request through detect, solve, resubmit and
/// retry with backoff, reporting every outcome to the monitor.
#[derive(Debug)]
pub struct ChallengeOrchestrator {
    config: OrchestratorConfig,
    detector: ChallengeDetector,
    solver: ChallengeSolver,
    dispatcher: Arc<Dispatcher>,
}

impl ChallengeOrchestrator {
    /// Create an orchestrator resubmitting through `dispatcher`
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(
        config: OrchestratorConfig,
        solver: ChallengeSolver,
        dispatcher: Arc<Dispatcher>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            detector: ChallengeDetector::new(),
            solver,
            dispatcher,
        })
    }

    /// Configuration of this orchestrator
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Resolve whatever challenge `response`, the answer to `request`,
    /// carries.
    ///
    /// An unchallenged response succeeds right away with zero attempts.
    /// Failures never escape as errors: they are carried by the returned
    /// [`ChallengeResult`].
    pub async fn resolve(
        &self,
        request: &HttpRequest,
        response: HttpResponse,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Resolution {
        let started = Instant::now();
        let info = self.detector.classify_response(&response);
        self.monitor().record_detection(info.challenge_type);
        if !info.is_challenge() {
            return Resolution {
                response,
                result: ChallengeResult::solved(ChallengeType::None, 0, started.elapsed()),
            };
        }

        log::debug!(
            "Detected {} challenge on {} (confidence {:.2}, ray {})",
            info.challenge_type,
            response.url,
            info.confidence,
            info.ray_id.as_deref().unwrap_or("-")
        );

        let key = HostKey::try_from(&request.url).ok();
        let mut pending = PendingChallenge {
            monitor: self.monitor(),
            key: key.as_ref(),
            challenge_type: info.challenge_type,
            cancel,
            finished: false,
        };
        let (response, result) = self
            .run(request, info, response, priority, cancel, started)
            .await;
        pending.finished = true;
        if let Some(key) = &key {
            self.monitor().record_challenge(key, &result);
        }
        Resolution { response, result }
    }

    async fn run(
        &self,
        request: &HttpRequest,
        mut info: ChallengeInfo,
        mut page: HttpResponse,
        priority: Priority,
        cancel: &CancellationToken,
        started: Instant,
    ) -> (HttpResponse, ChallengeResult) {
        let challenge_type = info.challenge_type;
        if let Some(reason) = self.solver.unsupported_reason(challenge_type) {
            log::warn!("Giving up on {challenge_type} challenge at {}: {reason}", page.url);
            let error = ErrorKind::UnsolvableChallenge(challenge_type, reason);
            return (page, ChallengeResult::failed(challenge_type, 0, started.elapsed(), error));
        }

        let mut attempts = 0;
        let mut last_error = None;
        while attempts < self.config.max_attempts {
            attempts += 1;
            match self
                .attempt(request, &info, &page, attempts, priority, cancel)
                .await
            {
                Ok(next) => {
                    let next_info = self.detector.classify_response(&next);
                    self.monitor().record_detection(next_info.challenge_type);
                    if !next_info.is_challenge() {
                        let result = ChallengeResult::solved(challenge_type, attempts, started.elapsed());
                        return (next, result);
                    }
                    log::warn!(
                        "Attempt {attempts} at {} answered with a {} challenge",
                        page.url,
                        next_info.challenge_type
                    );
                    let error = match self.solver.unsupported_reason(next_info.challenge_type) {
                        Some(reason) => ErrorKind::UnsolvableChallenge(next_info.challenge_type, reason),
                        None => SolverError::StillChallenged(next_info.challenge_type).into(),
                    };
                    info = next_info;
                    page = next;
                    last_error = Some(error);
                }
                Err(e) => {
                    log::warn!("Attempt {attempts} to solve {challenge_type} challenge failed: {e}");
                    last_error = Some(e);
                }
            }

            if last_error.as_ref().is_some_and(|e| !e.should_retry()) {
                break;
            }
            if attempts < self.config.max_attempts {
                let backoff = jitter(self.config.backoff(attempts), BACKOFF_JITTER);
                log::debug!("Backing off for {}ms before attempt {}", backoff.as_millis(), attempts + 1);
                if let Err(e) = pause(backoff, cancel).await {
                    last_error = Some(e);
                    break;
                }
            }
        }

        let error = last_error.unwrap_or(ErrorKind::Cancelled);
        let result = ChallengeResult::failed(challenge_type, attempts, started.elapsed(), error);
        (page, result)
    }

    /// One solve attempt: wait, solve, resubmit
    async fn attempt(
        &self,
        request: &HttpRequest,
        info: &ChallengeInfo,
        page: &HttpResponse,
        attempt: u32,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        if info.challenge_type == ChallengeType::JavaScript {
            let delay = info
                .page_delay
                .map_or(self.config.challenge_delay, |delay| delay.min(self.config.max_delay));
            pause(jitter(delay, PRESOLVE_JITTER), cancel).await?;
        }

        let (resubmission, referer) = match self.solver.solve(info, &page.url).await? {
            Solution::Submit(submission) => {
                (submission.with_timeout(request.timeout), Some(page.url.clone()))
            }
            Solution::Wait(wait) => {
                log::debug!("Rate limited at {}, waiting {}ms", page.url, wait.as_millis());
                pause(wait, cancel).await?;
                (request.clone(), None)
            }
        };

        let context = RequestContext {
            method: resubmission.method.clone(),
            attempt,
            referer,
        };
        self.dispatcher
            .send(resubmission, &context, priority, cancel)
            .await
    }

    fn monitor(&self) -> &Monitor {
        self.dispatcher.monitor()
    }
}

/// Reports a challenge run as failed if it is dropped before it ends,
/// e.g. by the timeout of its request
struct PendingChallenge<'a> {
    monitor: &'a Monitor,
    key: Option<&'a HostKey>,
    challenge_type: ChallengeType,
    cancel: &'a CancellationToken,
    finished: bool,
}

impl Drop for PendingChallenge<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("{} challenge run was dropped before it ended", self.challenge_type);
        if let Some(key) = self.key {
            self.monitor
                .record_interrupted_challenge(key, self.challenge_type, self.cancel.is_cancelled());
        }
    }
}

/// Scale `duration` by a random factor in `[1 - spread, 1 + spread]`
fn jitter(duration: Duration, spread: f64) -> Duration {
    let factor = rand::rng().random_range(1.0 - spread..=1.0 + spread);
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(duration)
}

/// Sleep for `duration` unless `cancel` fires first
async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(ErrorKind::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}
