use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::monitor::Monitor;
use crate::ratelimit::{HostKey, RateLimiterPool};
use crate::transport::{FingerprintProvider, RequestContext, Transport, TransportError};
use crate::types::{HttpRequest, HttpResponse, Priority};
use crate::Result;

/// Cost of a single request in the rate limiters
const REQUEST_COST: u32 = 1;

/// Sends single requests the way every request of a client goes out:
/// admitted by both rate limiters of its host, decorated with the
/// fingerprint headers and timed into the [`Monitor`].
#[derive(Debug)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    fingerprint: Arc<dyn FingerprintProvider>,
    limiters: Arc<RateLimiterPool>,
    monitor: Arc<Monitor>,
}

impl Dispatcher {
    /// Create a dispatcher from its collaborators
    #[must_use]
    pub const fn new(
        transport: Arc<dyn Transport>,
        fingerprint: Arc<dyn FingerprintProvider>,
        limiters: Arc<RateLimiterPool>,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            transport,
            fingerprint,
            limiters,
            monitor,
        }
    }

    /// Rate limiters requests are admitted by
    #[must_use]
    pub const fn limiters(&self) -> &Arc<RateLimiterPool> {
        &self.limiters
    }

    /// Monitor responses are recorded into
    #[must_use]
    pub const fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Send `request` once.
    ///
    /// Limiter admission is held only for the duration of the transport
    /// call and released however the call ends, including when this
    /// future is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL has no host, a limiter rejects the
    /// request, the transport fails or `cancel` fires.
    pub async fn send(
        &self,
        mut request: HttpRequest,
        context: &RequestContext,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let key = HostKey::try_from(&request.url)?;
        let permit = tokio::select! {
            () = cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            admitted = self.limiters.acquire(&key, REQUEST_COST, priority) => admitted?,
        };

        let headers = self.fingerprint.headers_for(&request.url, context);
        request.merge_missing_headers(&headers);

        log::debug!("{} {} (attempt {})", request.method, request.url, context.attempt);
        let start = Instant::now();
        let result = self.transport.send(request, cancel).await;
        drop(permit);

        let response = result?;
        self.monitor.record_response(response.status, start.elapsed());
        Ok(response)
    }
}
