//! Entry point for issuing requests.
//!
//! This module defines two structs, [`Client`] and [`ClientBuilder`].
//! `Client` runs requests through the whole pipeline: scheduling, rate
//! limiting, transport, challenge handling and monitoring.
//! `ClientBuilder` wires a `Client` from a [`ClientConfig`] and optional
//! collaborators.
//!
//! For convenience, a free function [`get`] is provided for ad-hoc
//! requests.
#![allow(clippy::module_name_repetitions)]
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use url::Url;

use crate::challenge::{
    ChallengeOrchestrator, ChallengeResult, ChallengeSolver, JsEvaluator, Resolution,
};
use crate::config::{ClientConfig, ConfigError};
use crate::dispatch::Dispatcher;
use crate::monitor::{Monitor, PerformanceMetrics};
use crate::ratelimit::{HostKey, KeyConfigs, RateLimitStatus, RateLimiterPool};
use crate::scheduler::{ConcurrencyMetrics, TaskHandle, TaskScheduler};
use crate::transport::{
    FingerprintProvider, ReqwestTransport, RequestContext, StaticHeaders, Transport,
};
use crate::types::{HttpRequest, HttpResponse, Priority};
use crate::{ErrorKind, Result};

/// Builder for [`Client`].
///
/// All collaborators are optional: without them the client talks HTTP
/// through [`ReqwestTransport`], sends [`StaticHeaders`] and evaluates
/// challenge scripts with the restricted interpreter only.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[builder(builder_method(doc = "
Create a builder for building `ClientBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `ClientBuilder`.
"))]
pub struct ClientBuilder {
    /// Every tunable of the client
    config: ClientConfig,
    /// Rate limits for individual hosts, overriding `requests_per_second`
    /// and `burst`
    key_configs: KeyConfigs,
    /// Sends requests over the wire, [`ReqwestTransport`] if unset
    transport: Option<Arc<dyn Transport>>,
    /// Supplies outbound headers, [`StaticHeaders`] with the configured
    /// user agent if unset
    fingerprint: Option<Arc<dyn FingerprintProvider>>,
    /// Evaluates JavaScript challenges before the restricted interpreter
    /// is tried
    evaluator: Option<Arc<dyn JsEvaluator>>,
}

impl Default for ClientBuilder {
    #[must_use]
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientBuilder {
    /// Instantiates a [`Client`].
    ///
    /// # Errors
    ///
    /// Returns an `Err` if:
    /// - The configuration has out-of-range values.
    /// - The user agent is not a valid header value.
    /// - The default transport cannot be created.
    pub fn client(self) -> Result<Client> {
        let Self {
            config,
            key_configs,
            transport,
            fingerprint,
            evaluator,
        } = self;
        config.validate()?;

        let transport = match transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let fingerprint = match fingerprint {
            Some(fingerprint) => fingerprint,
            None => Arc::new(default_fingerprint(config.user_agent.as_deref())?),
        };

        let limiters = Arc::new(RateLimiterPool::new(
            config.global_rate_limit_config(),
            config.rate_limit_config(),
            key_configs,
        )?);
        let monitor = Arc::new(Monitor::new(Arc::clone(&limiters)));
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            fingerprint,
            limiters,
            monitor,
        ));

        let mut solver = ChallengeSolver::new(config.solver_config())?;
        if let Some(evaluator) = evaluator {
            solver = solver.with_evaluator(evaluator);
        }
        let orchestrator = Arc::new(ChallengeOrchestrator::new(
            config.orchestrator_config(),
            solver,
            Arc::clone(&dispatcher),
        )?);
        let scheduler = TaskScheduler::new(config.scheduler_config())?;

        Ok(Client {
            scheduler,
            dispatcher,
            orchestrator,
            request_timeout: config.request_timeout,
        })
    }
}

fn default_fingerprint(user_agent: Option<&str>) -> std::result::Result<StaticHeaders, ConfigError> {
    match user_agent {
        Some(user_agent) => StaticHeaders::new(user_agent)
            .map_err(|e| ConfigError::out_of_range("user_agent", e.to_string())),
        None => Ok(StaticHeaders::default()),
    }
}

/// A request together with how it should be scheduled
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// What to send
    pub request: HttpRequest,
    /// Scheduling priority
    pub priority: Priority,
    /// Timeout of the whole run including challenge handling, the
    /// configured `request_timeout` if unset
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    /// Schedule `request` at [`Priority::Normal`]
    #[must_use]
    pub const fn new(request: HttpRequest) -> Self {
        Self {
            request,
            priority: Priority::Normal,
            timeout: None,
        }
    }

    /// Change the priority
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Change the timeout of the whole run
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<HttpRequest> for RequestSpec {
    fn from(request: HttpRequest) -> Self {
        Self::new(request)
    }
}

/// Final response of a request
#[derive(Debug)]
pub struct ClientResponse {
    /// The unchallenged response
    pub response: HttpResponse,
    /// How the challenge in front of it was resolved, if there was one
    pub challenge: Option<ChallengeResult>,
}

/// Everything a [`Client`] measures, ready to be exported as JSON
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetrics {
    /// Scheduler state
    pub concurrency: ConcurrencyMetrics,
    /// State of every rate limiter by key, the shared one under `global`
    pub rate_limits: BTreeMap<String, RateLimitStatus>,
    /// Request and challenge statistics
    pub performance: PerformanceMetrics,
}

impl ClientMetrics {
    /// Serialize as a JSON document
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be represented in JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Issues requests under concurrency and rate limits, resolving the
/// challenges it runs into.
///
/// See [`ClientBuilder`] for how to create one.
#[derive(Debug)]
pub struct Client {
    scheduler: TaskScheduler,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<ChallengeOrchestrator>,
    request_timeout: Duration,
}

impl Client {
    /// Run a request through the whole pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler or a rate limiter rejects the
    /// request, the transport fails, the run times out, or a challenge
    /// could not be resolved. The latter carries the final
    /// [`ChallengeResult`] in [`ErrorKind::ChallengeUnresolved`].
    pub async fn request(&self, spec: impl Into<RequestSpec>) -> Result<ClientResponse> {
        self.submit(spec)?.await
    }

    /// Queue a request and return a handle to its response right away,
    /// e.g. to cancel it through [`Client::scheduler`].
    ///
    /// # Errors
    ///
    /// Returns an error if the URL has no host, or the scheduler rejects
    /// the request.
    pub fn submit(&self, spec: impl Into<RequestSpec>) -> Result<TaskHandle<ClientResponse>> {
        let RequestSpec {
            request,
            priority,
            timeout,
        } = spec.into();
        let key = HostKey::try_from(&request.url)?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let orchestrator = Arc::clone(&self.orchestrator);

        self.scheduler.submit(
            move |cancel| async move {
                let mut run = RunGuard {
                    monitor: Arc::clone(dispatcher.monitor()),
                    key,
                    cancel: cancel.clone(),
                    resolving: false,
                    finished: false,
                };
                let context = RequestContext::initial(request.method.clone());
                let response = match dispatcher
                    .send(request.clone(), &context, priority, &cancel)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        run.finish(false, false);
                        return Err(e);
                    }
                };

                run.resolving = true;
                let Resolution { response, result } = orchestrator
                    .resolve(&request, response, priority, &cancel)
                    .await;
                let challenged = result.challenge_type.is_challenge();
                run.finish(result.success, challenged);

                if !result.success {
                    return Err(ErrorKind::ChallengeUnresolved(Box::new(result)));
                }
                Ok(ClientResponse {
                    response,
                    challenge: challenged.then_some(result),
                })
            },
            priority,
            timeout,
        )
    }

    /// `GET` `url` at [`Priority::Normal`]
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn get(&self, url: &str) -> Result<ClientResponse> {
        let url = Url::parse(url)?;
        self.request(HttpRequest::get(url).with_timeout(self.request_timeout))
            .await
    }

    /// `POST` `fields` as an urlencoded form to `url` at [`Priority::Normal`]
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn post_form<'a, I>(&self, url: &str, fields: I) -> Result<ClientResponse>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let url = Url::parse(url)?;
        let request = HttpRequest::new(http::Method::POST, url)
            .with_timeout(self.request_timeout)
            .with_form(fields);
        self.request(request).await
    }

    /// Snapshot of all metrics
    #[must_use]
    pub fn metrics(&self) -> ClientMetrics {
        ClientMetrics {
            concurrency: self.scheduler.metrics(),
            rate_limits: self.dispatcher.limiters().statuses().into_iter().collect(),
            performance: self.dispatcher.monitor().metrics(),
        }
    }

    /// The scheduler running this client's requests
    #[must_use]
    pub const fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Stop accepting requests, wait for the running ones and cancel
    /// everything still queued
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        log::info!("Client shut down");
    }
}

/// Records how a request run ended, as a failure if the run is dropped
/// before [`RunGuard::finish`] by its timeout or a cancellation.
struct RunGuard {
    monitor: Arc<Monitor>,
    key: HostKey,
    cancel: CancellationToken,
    /// Past the first response; any interruption from here on happens
    /// inside a challenge run, which reports to the limiters itself
    resolving: bool,
    finished: bool,
}

impl RunGuard {
    fn finish(&mut self, success: bool, challenged: bool) {
        self.finished = true;
        self.monitor.record_outcome(&self.key, success, challenged);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.monitor
                .record_interrupted(&self.key, self.resolving, self.cancel.is_cancelled());
        }
    }
}

/// A convenience function to fetch a single URL with a default [`Client`].
///
/// # Errors
///
/// Returns an error if the client cannot be created or the request fails.
pub async fn get(url: &str) -> Result<ClientResponse> {
    let client = ClientBuilder::default().client()?;
    let response = client.get(url).await;
    client.shutdown().await;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeType;
    use crate::ratelimit::{BackpressureStrategy, RateLimitConfig};
    use crate::test_utils::{ScriptedTransport, load_fixture};
    use crate::types::Backpressure;
    use http::StatusCode;
    use pretty_assertions::assert_eq;

    const URL: &str = "https://example.com/page";

    fn client_with(transport: &Arc<ScriptedTransport>, config: ClientConfig) -> Client {
        ClientBuilder::builder()
            .config(config)
            .transport(Arc::clone(transport) as Arc<dyn Transport>)
            .build()
            .client()
            .unwrap()
    }

    fn page(status: StatusCode, fixture: &str) -> HttpResponse {
        HttpResponse::new(status, Url::parse(URL).unwrap())
            .with_header("cf-ray", "8a1b2c3d4e5f6a7b-AMS")
            .with_header("server", "cloudflare")
            .with_body(load_fixture(fixture))
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_request() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(HttpResponse::new(StatusCode::OK, Url::parse(URL).unwrap()).with_body("hello"));
        let client = client_with(&transport, ClientConfig::default());

        let response = client.get(URL).await.unwrap();
        assert_eq!(response.response.status, StatusCode::OK);
        assert_eq!(response.response.body, "hello");
        assert!(response.challenge.is_none());

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].headers["user-agent"].to_str().unwrap().starts_with("hurdle/"));

        let metrics = client.metrics();
        assert_eq!(metrics.performance.total_requests, 1);
        assert_eq!(metrics.performance.successful_requests, 1);
        assert_eq!(metrics.concurrency.completed_tasks, 1);
        assert!(metrics.rate_limits.contains_key("global"));
        assert!(metrics.rate_limits.contains_key("example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_javascript_challenge_is_resolved() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(page(StatusCode::SERVICE_UNAVAILABLE, "challenges/javascript.html"));
        transport.push(HttpResponse::new(StatusCode::OK, Url::parse(URL).unwrap()));
        let client = client_with(&transport, ClientConfig::default());

        let response = client.get(URL).await.unwrap();
        let challenge = response.challenge.unwrap();
        assert!(challenge.success);
        assert_eq!(challenge.attempts, 1);
        assert_eq!(challenge.challenge_type, ChallengeType::JavaScript);

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].url.as_str().contains("jschl_answer=26"));
        assert!(sent[1].url.as_str().contains("jschl_vc=abc123"));

        let performance = client.metrics().performance;
        assert_eq!(performance.challenges[&ChallengeType::JavaScript].solved, 1);
        assert_eq!(performance.status_codes[&503], 1);
        assert_eq!(performance.status_codes[&200], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolvable_challenge_surfaces_as_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(page(StatusCode::FORBIDDEN, "challenges/firewall.html"));
        let client = client_with(&transport, ClientConfig::default());

        let Err(ErrorKind::ChallengeUnresolved(result)) = client.get(URL).await else {
            panic!("expected an unresolved challenge");
        };
        assert!(!result.success);
        assert_eq!(result.challenge_type, ChallengeType::Firewall);
        assert_eq!(result.attempts, 0);
        assert!(matches!(
            result.error,
            Some(ErrorKind::UnsolvableChallenge(ChallengeType::Firewall, _))
        ));
        assert_eq!(client.metrics().performance.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_form_sends_body() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client_with(&transport, ClientConfig::default());
        client
            .post_form(URL, [("user", "jane"), ("q", "a b")])
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent[0].method, http::Method::POST);
        assert_eq!(sent[0].body.as_deref(), Some("user=jane&q=a+b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_rejection() {
        let transport = Arc::new(ScriptedTransport::new());
        let config = ClientConfig {
            requests_per_second: 1.0,
            burst: Some(1),
            backpressure_strategy: BackpressureStrategy::Drop,
            ..ClientConfig::default()
        };
        let client = client_with(&transport, config);

        client.get(URL).await.unwrap();
        let err = client.get(URL).await.unwrap_err();
        assert!(matches!(
            err,
            ErrorKind::BackpressureRejected(Backpressure::RateLimiter { ref key, .. }) if key == "example.com"
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_is_recorded() {
        let transport = Arc::new(ScriptedTransport::with_latency(Duration::from_secs(10)));
        let config = ClientConfig {
            request_timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        };
        let client = client_with(&transport, config);

        let err = client.get(URL).await.unwrap_err();
        assert!(matches!(err, ErrorKind::Timeout(_)), "{err}");

        let metrics = client.metrics();
        assert_eq!(metrics.performance.total_requests, 1);
        assert_eq!(metrics.performance.failed_requests, 1);
        assert_eq!(metrics.concurrency.failed_tasks, 1);
        assert_eq!(metrics.rate_limits["example.com"].in_flight, 0);
        assert_eq!(metrics.rate_limits["global"].in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_overrides() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = ClientBuilder::builder()
            .transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .key_configs(KeyConfigs::from([(
                "slow.example.com".to_string(),
                RateLimitConfig::per_second(2.0),
            )]))
            .build()
            .client()
            .unwrap();
        client.get("https://slow.example.com/").await.unwrap();

        let statuses = client.metrics().rate_limits;
        assert!((statuses["slow.example.com"].current_rate - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_new_requests() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client_with(&transport, ClientConfig::default());
        client.shutdown().await;
        assert!(matches!(client.get(URL).await, Err(ErrorKind::ShuttingDown)));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let result = ClientBuilder::builder()
            .config(ClientConfig {
                max_concurrent_requests: 0,
                ..ClientConfig::default()
            })
            .build()
            .client();
        assert!(matches!(result, Err(ErrorKind::Config(_))));

        let result = ClientBuilder::builder()
            .config(ClientConfig {
                user_agent: Some("bad\nagent".into()),
                ..ClientConfig::default()
            })
            .transport(Arc::new(ScriptedTransport::new()) as Arc<dyn Transport>)
            .build()
            .client();
        assert!(matches!(
            result,
            Err(ErrorKind::Config(ConfigError::OutOfRange { field: "user_agent", .. }))
        ));
    }

    #[test]
    fn test_metrics_json() {
        let metrics = ClientMetrics {
            concurrency: ConcurrencyMetrics::default(),
            rate_limits: BTreeMap::new(),
            performance: PerformanceMetrics::default(),
        };
        let json: serde_json::Value = serde_json::from_str(&metrics.to_json().unwrap()).unwrap();
        assert_eq!(json["performance"]["total_requests"], 0);
        assert!(json["concurrency"].is_object());
    }
}
