//! Collaborators that move bytes over the wire.
//!
//! The orchestration core never talks to the network directly. It goes
//! through a [`Transport`] and asks a [`FingerprintProvider`] for the
//! outbound headers. [`ReqwestTransport`] and [`StaticHeaders`] are the
//! default implementations.
use async_trait::async_trait;
use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, InvalidHeaderValue, USER_AGENT};
use http::Method;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::types::{HttpRequest, HttpResponse};

/// Default user agent, `hurdle/<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("hurdle/", env!("CARGO_PKG_VERSION"));

// Constants currently not configurable by the user.
/// A timeout for only the connect phase of a request.
const CONNECT_TIMEOUT: u64 = 10;
/// TCP keepalive
const TCP_KEEPALIVE: u64 = 60;

/// Errors raised by a [`Transport`]
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request did not complete within its timeout
    #[error("Request timed out")]
    Timeout,

    /// No connection could be established
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The TLS handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Any other error while sending the request
    #[error("Request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The response body could not be read
    #[error("Failed to read response body: {0}")]
    ReadBody(#[source] reqwest::Error),

    /// The underlying HTTP client could not be built
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The call was cancelled cooperatively
    #[error("Request was cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if is_tls_error(&e) {
            Self::Tls(error_chain(&e))
        } else if e.is_connect() {
            Self::Connect(error_chain(&e))
        } else {
            Self::Request(e)
        }
    }
}

/// Join an error and all its sources into one line
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn is_tls_error(err: &dyn std::error::Error) -> bool {
    let chain = error_chain(err).to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| chain.contains(needle))
}

/// Sends a request and returns the complete response.
///
/// Implementations must honour `cancel`: once it fires, the call should
/// return [`TransportError::Cancelled`] as soon as possible.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Perform one request
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by [`reqwest`], with a cookie store so that
/// clearance cookies survive between the challenge and the retry.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with default settings
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be created,
    /// e.g. because the TLS backend fails to initialize.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT))
            .tcp_keepalive(Duration::from_secs(TCP_KEEPALIVE))
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let send = async {
            let response = builder.send().await?;
            HttpResponse::from_response(response).await
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            result = send => result,
        }
    }
}

/// What the caller knows about a request when asking for headers
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Method of the outgoing request
    pub method: Method,
    /// 0 for the initial request, then 1, 2, ... for challenge resubmissions
    pub attempt: u32,
    /// Page that led to this request, e.g. the challenge page
    pub referer: Option<Url>,
}

impl RequestContext {
    /// Context of an initial request
    #[must_use]
    pub const fn initial(method: Method) -> Self {
        Self {
            method,
            attempt: 0,
            referer: None,
        }
    }
}

/// Supplies the outbound headers for a request.
///
/// The core treats the returned headers as opaque; headers set explicitly
/// on a request always take precedence.
pub trait FingerprintProvider: Send + Sync + std::fmt::Debug {
    /// Headers to send with a request to `url`
    fn headers_for(&self, url: &Url, context: &RequestContext) -> HeaderMap;
}

/// A [`FingerprintProvider`] returning the same headers for every request,
/// plus a `Referer` when the context has one.
#[derive(Debug, Clone)]
pub struct StaticHeaders {
    headers: HeaderMap,
}

impl StaticHeaders {
    /// Create a provider with the given user agent and generic accept headers
    ///
    /// # Errors
    ///
    /// Returns an error if `user_agent` is not a valid header value.
    pub fn new(user_agent: &str) -> Result<Self, InvalidHeaderValue> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(user_agent)?);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        Ok(Self { headers })
    }
}

impl Default for StaticHeaders {
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        Self { headers }
    }
}

impl FingerprintProvider for StaticHeaders {
    fn headers_for(&self, _url: &Url, context: &RequestContext) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(referer) = &context.referer
            && let Ok(value) = HeaderValue::from_str(referer.as_str())
        {
            headers.insert(http::header::REFERER, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_reqwest_transport_round_trip() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("jschl_answer=26"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cf-ray", "8a1b2c3d4e5f-AMS")
                    .set_body_string("welcome"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let url = Url::parse(&format!("{}/submit", mock_server.uri())).unwrap();
        let request = HttpRequest::new(Method::POST, url).with_form([("jschl_answer", "26")]);

        let response = transport
            .send(request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "welcome");
        assert_eq!(response.headers.get("cf-ray").unwrap(), "8a1b2c3d4e5f-AMS");
    }

    #[tokio::test]
    async fn test_reqwest_transport_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let url = Url::parse(&mock_server.uri()).unwrap();
        let request = HttpRequest::get(url).with_timeout(Duration::from_millis(100));

        let result = transport.send(request, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_reqwest_transport_cancellation() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let url = Url::parse(&mock_server.uri()).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = transport.send(HttpRequest::get(url), &cancel).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }

    #[test]
    fn test_static_headers_add_referer() {
        let provider = StaticHeaders::new("test-agent/1.0").unwrap();
        let url = Url::parse("https://example.com/next").unwrap();
        let context = RequestContext {
            method: Method::POST,
            attempt: 1,
            referer: Some(Url::parse("https://example.com/").unwrap()),
        };

        let headers = provider.headers_for(&url, &context);
        assert_eq!(headers.get(USER_AGENT).unwrap(), "test-agent/1.0");
        assert_eq!(
            headers.get(http::header::REFERER).unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn test_default_user_agent() {
        let provider = StaticHeaders::default();
        let url = Url::parse("https://example.com/").unwrap();
        let headers = provider.headers_for(&url, &RequestContext::initial(Method::GET));
        assert!(
            headers
                .get(USER_AGENT)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("hurdle/")
        );
    }
}
