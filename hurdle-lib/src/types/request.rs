use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use std::time::Duration;
use url::Url;

use crate::transport::TransportError;

/// Default timeout of a single transport call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An outbound request handed to a [`crate::Transport`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Target URL, including any query string
    pub url: Url,
    /// Outbound headers
    pub headers: HeaderMap,
    /// Optional request body
    pub body: Option<String>,
    /// Deadline for the whole send/receive cycle
    pub timeout: Duration,
}

impl HttpRequest {
    /// Create a request without headers or body
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Shorthand for a `GET` request
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Set the request timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Insert a single header, replacing any previous value
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach form fields.
    ///
    /// `GET` requests get the fields appended to the query string,
    /// all other methods send them as an urlencoded body.
    #[must_use]
    pub fn with_form<'a, I>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        if self.method == Method::GET {
            self.url.query_pairs_mut().extend_pairs(fields);
        } else {
            let body = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(fields)
                .finish();
            self.headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            self.body = Some(body);
        }
        self
    }

    /// Merge headers that are not yet set on this request
    pub fn merge_missing_headers(&mut self, headers: &HeaderMap) {
        for (name, value) in headers {
            if !self.headers.contains_key(name) {
                self.headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// The result of a transport call.
///
/// This owns the body so that a response can be inspected by the detector
/// and kept around for the caller.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Decoded response body
    pub body: String,
    /// Final URL after redirects
    pub url: Url,
}

impl HttpResponse {
    /// Create a response with an empty body and no headers
    #[must_use]
    pub fn new(status: StatusCode, url: Url) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
            url,
        }
    }

    /// Set the response body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Insert a header; invalid names or values are ignored
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub(crate) async fn from_response(response: reqwest::Response) -> Result<Self, TransportError> {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.text().await.map_err(TransportError::ReadBody)?;

        Ok(Self {
            status,
            headers,
            body,
            url,
        })
    }
}
