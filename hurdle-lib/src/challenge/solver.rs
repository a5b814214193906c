use http::Method;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::evaluator::{Bindings, JsEvaluator};
use super::extract;
use super::interpreter::{self, InterpreterError};
use super::{ChallengeInfo, ChallengeType, UnsupportedReason};
use crate::config::ConfigError;
use crate::types::HttpRequest;
use crate::{ErrorKind, Result};

/// Form field carrying the answer of a JavaScript challenge
pub const ANSWER_FIELD: &str = "jschl_answer";

/// Jitter range applied to rate-limit waits
const RATE_LIMIT_JITTER: std::ops::RangeInclusive<f64> = 0.5..=1.5;

/// Statements touching the page instead of computing the answer
static DOM_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:document|window|location|navigator)\b|\.(?:value|submit|action|innerHTML|firstChild|href|match|substr|toFixed|getElementById|createElement)\b",
    )
    .expect("DOM statement regex should be valid")
});

/// Statements consisting of a lone string literal, padding in many challenges
static STRING_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:'[^']*'|"[^"]*")\s*$"#).expect("string statement regex should be valid")
});

/// Errors while computing a solution
#[derive(Error, Debug, PartialEq)]
pub enum SolverError {
    /// The page carries no challenge script
    #[error("Challenge page has no script")]
    MissingScript,

    /// The page carries no challenge form
    #[error("Challenge page has no submit URL")]
    MissingSubmitUrl,

    /// The form action cannot be resolved against the page URL
    #[error("Invalid submit URL: {0}")]
    InvalidSubmitUrl(#[from] url::ParseError),

    /// The restricted interpreter failed, after the evaluator did or in its absence
    #[error("Cannot evaluate challenge script: {0}")]
    Interpreter(#[from] InterpreterError),

    /// The script evaluated to NaN or infinity
    #[error("Challenge answer is not a finite number: {0}")]
    InvalidAnswer(f64),

    /// Asked to solve a response without challenge
    #[error("Response carries no challenge")]
    NoChallenge,

    /// The submitted solution was answered with another challenge
    #[error("Still challenged after submitting a solution, now `{0}`")]
    StillChallenged(ChallengeType),
}

/// What to do to get past a challenge
#[derive(Debug, Clone)]
pub enum Solution {
    /// Send this request, carrying the answer
    Submit(HttpRequest),
    /// Wait, then repeat the original request unchanged
    Wait(Duration),
}

/// Configuration of a [`ChallengeSolver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Solve JavaScript challenges
    pub solve_javascript: bool,
    /// Attempt managed challenges
    pub solve_managed: bool,
    /// Attempt Turnstile challenges
    pub solve_turnstile: bool,
    /// Wait out rate limits
    pub handle_rate_limits: bool,
    /// Wait used when a rate limit has no `Retry-After`
    #[serde(with = "humantime_serde")]
    pub rate_limit_base_delay: Duration,
    /// Upper bound of a rate-limit wait, jitter included
    #[serde(with = "humantime_serde")]
    pub rate_limit_max_wait: Duration,
    /// Timeout of the JS evaluator
    #[serde(with = "humantime_serde")]
    pub js_timeout: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            solve_javascript: true,
            solve_managed: false,
            solve_turnstile: false,
            handle_rate_limits: true,
            rate_limit_base_delay: Duration::from_secs(1),
            rate_limit_max_wait: Duration::from_secs(60),
            js_timeout: Duration::from_secs(5),
        }
    }
}

impl SolverConfig {
    /// Check every parameter for its valid range
    ///
    /// # Errors
    ///
    /// Returns the first parameter found out of range.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.js_timeout.is_zero() {
            return Err(ConfigError::out_of_range("js_timeout", "must not be zero"));
        }
        if self.rate_limit_max_wait.is_zero() {
            return Err(ConfigError::out_of_range("rate_limit_max_wait", "must not be zero"));
        }
        Ok(())
    }
}

/// Produces solutions for the challenge kinds that can be handled without
/// an external solver: JavaScript arithmetic and rate limits.
///
/// Every other kind is reported as unsolvable. Nothing is ever faked.
#[derive(Debug, Clone)]
pub struct ChallengeSolver {
    config: SolverConfig,
    evaluator: Option<Arc<dyn JsEvaluator>>,
}

impl ChallengeSolver {
    /// Create a solver using only the restricted interpreter
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn new(config: SolverConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            evaluator: None,
        })
    }

    /// Evaluate scripts with `evaluator` first, falling back to the
    /// restricted interpreter when it fails
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn JsEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Configuration of this solver
    #[must_use]
    pub const fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Why `challenge_type` will not be solved, or `None` if it will be
    #[must_use]
    pub const fn unsupported_reason(&self, challenge_type: ChallengeType) -> Option<UnsupportedReason> {
        match challenge_type {
            ChallengeType::JavaScript if self.config.solve_javascript => None,
            ChallengeType::RateLimited if self.config.handle_rate_limits => None,
            ChallengeType::JavaScript | ChallengeType::RateLimited => Some(UnsupportedReason::Disabled),
            ChallengeType::Turnstile if !self.config.solve_turnstile => Some(UnsupportedReason::Disabled),
            ChallengeType::Managed if !self.config.solve_managed => Some(UnsupportedReason::Disabled),
            ChallengeType::Turnstile | ChallengeType::Managed | ChallengeType::BotFight => {
                Some(UnsupportedReason::NoSolverAvailable)
            }
            ChallengeType::Blocked | ChallengeType::Firewall => Some(UnsupportedReason::AccessDenied),
            ChallengeType::Unknown | ChallengeType::None => Some(UnsupportedReason::Unrecognized),
        }
    }

    /// Compute a solution for the challenge described by `info`, found on
    /// the page at `page_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnsolvableChallenge`] for kinds that are not
    /// handled and [`ErrorKind::Solver`] when a supported challenge cannot
    /// be solved.
    pub async fn solve(&self, info: &ChallengeInfo, page_url: &Url) -> Result<Solution> {
        if !info.is_challenge() {
            return Err(SolverError::NoChallenge.into());
        }
        if let Some(reason) = self.unsupported_reason(info.challenge_type) {
            log::debug!("Not solving {} challenge: {reason}", info.challenge_type);
            return Err(ErrorKind::UnsolvableChallenge(info.challenge_type, reason));
        }

        match info.challenge_type {
            ChallengeType::JavaScript => self.solve_javascript(info, page_url).await,
            ChallengeType::RateLimited => Ok(Solution::Wait(self.rate_limit_wait(info.retry_after))),
            other => Err(ErrorKind::UnsolvableChallenge(
                other,
                UnsupportedReason::NoSolverAvailable,
            )),
        }
    }

    /// Wait before retrying a rate-limited request: `retry_after` or the
    /// base delay, jittered by a factor in `[0.5, 1.5]`, then capped.
    /// A jittered wait too large to represent is capped as well.
    #[must_use]
    pub fn rate_limit_wait(&self, retry_after: Option<Duration>) -> Duration {
        let base = retry_after.unwrap_or(self.config.rate_limit_base_delay);
        let factor = rand::rng().random_range(RATE_LIMIT_JITTER);
        let max_wait = self.config.rate_limit_max_wait;
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .map_or(max_wait, |wait| wait.min(max_wait))
    }

    async fn solve_javascript(&self, info: &ChallengeInfo, page_url: &Url) -> Result<Solution> {
        let script = info.script.as_deref().ok_or(SolverError::MissingScript)?;
        let action = info
            .submit_url
            .as_deref()
            .ok_or(SolverError::MissingSubmitUrl)?;
        let domain = page_url.host_str().ok_or(ErrorKind::InvalidUrlHost)?;

        let code = prepare_script(script);
        let bindings = Bindings::from([
            ("t".to_string(), domain.to_string()),
            ("domain".to_string(), domain.to_string()),
        ]);
        let value = self.evaluate(&code, &bindings).await?;

        #[allow(clippy::cast_precision_loss)]
        let answer = value + domain.len() as f64;
        if !answer.is_finite() {
            return Err(SolverError::InvalidAnswer(answer).into());
        }
        let answer = format_answer(answer);
        log::debug!("Computed answer {answer} for {domain}");

        let url = page_url.join(action).map_err(SolverError::from)?;
        let mut fields = info.form_fields.clone();
        fields.insert(ANSWER_FIELD.to_string(), answer);
        let method = info.form_method.clone().unwrap_or(Method::GET);
        let request = HttpRequest::new(method, url)
            .with_form(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Ok(Solution::Submit(request))
    }

    /// Evaluate with the external evaluator, falling back to the restricted
    /// interpreter on any failure
    async fn evaluate(&self, code: &str, bindings: &Bindings) -> std::result::Result<f64, SolverError> {
        if let Some(evaluator) = &self.evaluator {
            let timeout = self.config.js_timeout;
            match tokio::time::timeout(timeout, evaluator.eval(code, bindings, timeout)).await {
                Ok(Ok(value)) if value.is_finite() => return Ok(value),
                Ok(Ok(value)) => {
                    log::warn!("JS evaluator returned {value}, falling back to the interpreter");
                }
                Ok(Err(e)) => log::warn!("JS evaluator failed, falling back to the interpreter: {e}"),
                Err(_) => log::warn!(
                    "JS evaluator timed out after {}ms, falling back to the interpreter",
                    timeout.as_millis()
                ),
            }
        }
        Ok(interpreter::evaluate(code, bindings)?)
    }
}

/// Reduce a challenge script to its arithmetic: take the body of the
/// `setTimeout` callback, then drop statements that touch the page and
/// lone string literals
#[must_use]
pub fn prepare_script(script: &str) -> String {
    let code = extract::timeout_body(script).map_or_else(|| script.to_string(), |(code, _)| code);
    split_statements(&code)
        .into_iter()
        .map(str::trim)
        .filter(|statement| {
            !statement.is_empty()
                && !DOM_STATEMENT.is_match(statement)
                && !STRING_STATEMENT.is_match(statement)
        })
        .collect::<Vec<_>>()
        .join(";\n")
}

/// Split at `;` and line breaks outside of string literals
fn split_statements(code: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut quote = None;
    let mut escaped = false;
    for (i, c) in code.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                ';' | '\n' => {
                    statements.push(&code[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    statements.push(&code[start..]);
    statements
}

/// Integral answers as integers, others with ten decimals like `toFixed(10)`
fn format_answer(answer: f64) -> String {
    if answer.fract() == 0.0 && answer.abs() < 1e15 {
        interpreter::format_number(answer)
    } else {
        format!("{answer:.10}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::evaluator::EvaluatorError;
    use crate::challenge::{ChallengeDetector, RestrictedEvaluator};
    use async_trait::async_trait;
    use http::header::RETRY_AFTER;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    const SCRIPT: &str = r"
      setTimeout(function(){
        var s,t,o,p,b,r,e,a,k,i,n,g,f, answer;
        t = document.createElement('div');
        t.innerHTML = '<a href=\'/\'>x</a>';
        a = document.getElementById('jschl-answer');
        answer = 10 + 5;
        f = document.getElementById('challenge-form');
        a.value = answer + t.length; '; 121'
        f.submit();
      }, 4000);";

    fn js_info() -> ChallengeInfo {
        let mut info = ChallengeInfo::new(ChallengeType::JavaScript, 0.9, StatusCode::SERVICE_UNAVAILABLE, "");
        info.script = Some(SCRIPT.to_string());
        info.submit_url = Some("/cdn-cgi/l/chk_jschl".to_string());
        info.form_fields.insert("jschl_vc".into(), "abc123".into());
        info
    }

    fn page() -> Url {
        Url::parse("https://example.com/protected").unwrap()
    }

    fn solver() -> ChallengeSolver {
        ChallengeSolver::new(SolverConfig::default()).unwrap()
    }

    #[test]
    fn test_prepare_script_keeps_arithmetic_only() {
        assert_eq!(prepare_script(SCRIPT), "var s,t,o,p,b,r,e,a,k,i,n,g,f, answer;\nanswer = 10 + 5");
    }

    #[test]
    fn test_split_respects_strings() {
        assert_eq!(split_statements("a = 'x;y'; b = 2"), vec!["a = 'x;y'", " b = 2"]);
    }

    #[test]
    fn test_format_answer() {
        assert_eq!(format_answer(26.0), "26");
        assert_eq!(format_answer(-3.0), "-3");
        assert_eq!(format_answer(12.5), "12.5000000000");
    }

    #[tokio::test]
    async fn test_javascript_solution() {
        let Solution::Submit(request) = solver().solve(&js_info(), &page()).await.unwrap() else {
            panic!("expected a form submission");
        };
        assert_eq!(request.method, Method::GET);
        assert_eq!(
            request.url.as_str(),
            "https://example.com/cdn-cgi/l/chk_jschl?jschl_answer=26&jschl_vc=abc123"
        );
        assert_eq!(request.body, None);
    }

    #[tokio::test]
    async fn test_post_form_solution() {
        let mut info = js_info();
        info.form_method = Some(Method::POST);
        let Solution::Submit(request) = solver().solve(&info, &page()).await.unwrap() else {
            panic!("expected a form submission");
        };
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url.as_str(), "https://example.com/cdn-cgi/l/chk_jschl");
        assert_eq!(request.body.as_deref(), Some("jschl_answer=26&jschl_vc=abc123"));
    }

    #[tokio::test]
    async fn test_missing_parts_are_solver_errors() {
        let mut info = js_info();
        info.script = None;
        assert!(matches!(
            solver().solve(&info, &page()).await,
            Err(ErrorKind::Solver(SolverError::MissingScript))
        ));

        let mut info = js_info();
        info.submit_url = None;
        assert!(matches!(
            solver().solve(&info, &page()).await,
            Err(ErrorKind::Solver(SolverError::MissingSubmitUrl))
        ));

        let mut info = js_info();
        info.script = Some("setTimeout(function(){ answer = 1 +; }, 10)".into());
        assert!(matches!(
            solver().solve(&info, &page()).await,
            Err(ErrorKind::Solver(SolverError::Interpreter(_)))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_types_never_solved() {
        let solver = ChallengeSolver::new(SolverConfig {
            solve_managed: true,
            solve_turnstile: true,
            ..SolverConfig::default()
        })
        .unwrap();
        for challenge_type in ChallengeType::iter().filter(|t| !t.is_solvable() && t.is_challenge()) {
            let info = ChallengeInfo::new(challenge_type, 0.9, StatusCode::FORBIDDEN, "");
            let err = solver.solve(&info, &page()).await.unwrap_err();
            assert!(
                matches!(err, ErrorKind::UnsolvableChallenge(t, _) if t == challenge_type),
                "{challenge_type}: {err}"
            );
        }
    }

    #[test]
    fn test_unsupported_reasons() {
        let solver = solver();
        assert_eq!(
            solver.unsupported_reason(ChallengeType::Turnstile),
            Some(UnsupportedReason::Disabled)
        );
        assert_eq!(
            solver.unsupported_reason(ChallengeType::BotFight),
            Some(UnsupportedReason::NoSolverAvailable)
        );
        assert_eq!(
            solver.unsupported_reason(ChallengeType::Firewall),
            Some(UnsupportedReason::AccessDenied)
        );
        assert_eq!(solver.unsupported_reason(ChallengeType::JavaScript), None);

        let disabled = ChallengeSolver::new(SolverConfig {
            solve_javascript: false,
            handle_rate_limits: false,
            ..SolverConfig::default()
        })
        .unwrap();
        assert_eq!(
            disabled.unsupported_reason(ChallengeType::RateLimited),
            Some(UnsupportedReason::Disabled)
        );
    }

    #[test]
    fn test_rate_limit_wait_jitter_and_cap() {
        let solver = solver();
        for _ in 0..100 {
            let wait = solver.rate_limit_wait(Some(Duration::from_secs(2)));
            assert!(wait >= Duration::from_secs(1) && wait <= Duration::from_secs(3));

            let base = solver.rate_limit_wait(None);
            assert!(base >= Duration::from_millis(500) && base <= Duration::from_millis(1500));

            let capped = solver.rate_limit_wait(Some(Duration::from_secs(500)));
            assert_eq!(capped, Duration::from_secs(60));
        }
    }

    #[test]
    fn test_rate_limit_wait_with_huge_retry_after() {
        let solver = solver();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("18446744073709551615"));
        let retry_after = crate::ratelimit::headers::retry_after(&headers);
        assert_eq!(retry_after, Some(Duration::from_secs(u64::MAX)));

        for _ in 0..100 {
            assert_eq!(solver.rate_limit_wait(retry_after), Duration::from_secs(60));
            assert_eq!(solver.rate_limit_wait(Some(Duration::MAX)), Duration::from_secs(60));
        }
    }

    #[derive(Debug)]
    struct FailingEvaluator;

    #[async_trait]
    impl JsEvaluator for FailingEvaluator {
        async fn eval(&self, _: &str, _: &Bindings, _: Duration) -> std::result::Result<f64, EvaluatorError> {
            Err(EvaluatorError::Unavailable("no engine".into()))
        }
    }

    #[derive(Debug)]
    struct HangingEvaluator;

    #[async_trait]
    impl JsEvaluator for HangingEvaluator {
        async fn eval(&self, _: &str, _: &Bindings, _: Duration) -> std::result::Result<f64, EvaluatorError> {
            futures::future::pending().await
        }
    }

    async fn answer_with(solver: ChallengeSolver) -> String {
        let Solution::Submit(request) = solver.solve(&js_info(), &page()).await.unwrap() else {
            panic!("expected a form submission");
        };
        request
            .url
            .query_pairs()
            .find(|(k, _)| k == ANSWER_FIELD)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluator_and_fallback_agree() {
        let interpreted = answer_with(solver()).await;
        let evaluated = answer_with(solver().with_evaluator(Arc::new(RestrictedEvaluator))).await;
        let failed = answer_with(solver().with_evaluator(Arc::new(FailingEvaluator))).await;
        let hung = answer_with(solver().with_evaluator(Arc::new(HangingEvaluator))).await;
        assert_eq!(interpreted, "26");
        assert_eq!(evaluated, interpreted);
        assert_eq!(failed, interpreted);
        assert_eq!(hung, interpreted);
    }

    #[tokio::test]
    async fn test_detected_page_is_solvable() {
        let body = format!(
            r#"<html><head><title>Just a moment...</title></head><body>
            <div id="cf-browser-verification">Checking your browser before accessing example.com.</div>
            <script type="text/javascript">{SCRIPT}</script>
            <form id="challenge-form" action="/cdn-cgi/l/chk_jschl" method="get">
              <input type="hidden" name="jschl_vc" value="abc123"/>
              <input type="hidden" name="jschl_answer" value=""/>
            </form></body></html>"#
        );
        let mut headers = HeaderMap::new();
        headers.insert("cf-ray", HeaderValue::from_static("8a1b2c3d4e5f6a7b"));
        let info = ChallengeDetector::new().classify(&body, &headers, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(info.challenge_type, ChallengeType::JavaScript);

        let Solution::Submit(request) = solver().solve(&info, &page()).await.unwrap() else {
            panic!("expected a form submission");
        };
        assert!(request.url.as_str().contains("jschl_answer=26"));
    }
}
