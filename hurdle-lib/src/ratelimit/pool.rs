use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use super::config::RateLimitConfig;
use super::key::HostKey;
use super::limiter::{RateLimitStatus, RateLimiter};
use crate::config::ConfigError;
use crate::{Priority, Result};

/// Key under which the global limiter reports its status
pub const GLOBAL_KEY: &str = "global";

/// Per-key configuration overrides, keyed by hostname
pub type KeyConfigs = HashMap<String, RateLimitConfig>;

/// Admission granted by [`RateLimiterPool::acquire`].
///
/// Releases its cost on both limiters when dropped.
#[derive(Debug)]
#[must_use = "admission is released as soon as the permit is dropped"]
pub struct RateLimitPermit {
    global: Arc<RateLimiter>,
    limiter: Option<Arc<RateLimiter>>,
    cost: u32,
}

impl Drop for RateLimitPermit {
    fn drop(&mut self) {
        self.global.release(self.cost);
        if let Some(limiter) = self.limiter.take() {
            limiter.release(self.cost);
        }
    }
}

/// Coordinates one global [`RateLimiter`] with lazily created per-key
/// limiters. Every request has to pass the global limiter first and then
/// the limiter of its key.
#[derive(Debug)]
pub struct RateLimiterPool {
    global: Arc<RateLimiter>,
    limiters: DashMap<HostKey, Arc<RateLimiter>>,
    default_config: RateLimitConfig,
    key_configs: KeyConfigs,
}

impl RateLimiterPool {
    /// Create a pool from the global limit, the limit every key gets by
    /// default, and overrides for individual keys.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the configurations is invalid.
    pub fn new(
        global_config: RateLimitConfig,
        default_config: RateLimitConfig,
        key_configs: KeyConfigs,
    ) -> std::result::Result<Self, ConfigError> {
        default_config.validate()?;
        for config in key_configs.values() {
            config.validate()?;
        }
        Ok(Self {
            global: Arc::new(RateLimiter::new(GLOBAL_KEY, global_config)?),
            limiters: DashMap::new(),
            default_config,
            key_configs: key_configs
                .into_iter()
                .map(|(key, config)| (HostKey::from(key).to_string(), config))
                .collect(),
        })
    }

    /// The global limiter
    #[must_use]
    pub fn global(&self) -> &Arc<RateLimiter> {
        &self.global
    }

    /// Get the limiter of `key`, creating it on first use
    #[must_use]
    pub fn limiter(&self, key: &HostKey) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.get(key) {
            return Arc::clone(limiter.value());
        }

        match self.limiters.entry(key.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let config = self.config_for(key).clone();
                log::debug!(
                    "Creating {} rate limiter for `{key}` at {}/s",
                    config.algorithm,
                    config.rate
                );
                // validated in `new`
                let limiter = Arc::new(RateLimiter::with_validated(key.as_str(), config));
                Arc::clone(entry.insert(limiter).value())
            }
        }
    }

    /// Acquire admission from the global limiter, then from the limiter of
    /// `key`. Nothing stays acquired if either of them rejects, or if the
    /// returned future is dropped before it completes.
    ///
    /// # Errors
    ///
    /// Returns the rejection of whichever limiter refused the request.
    pub async fn acquire(&self, key: &HostKey, cost: u32, priority: Priority) -> Result<RateLimitPermit> {
        self.global.acquire(cost, priority).await?;
        let mut permit = RateLimitPermit {
            global: Arc::clone(&self.global),
            limiter: None,
            cost,
        };
        let limiter = self.limiter(key);
        limiter.acquire(cost, priority).await?;
        permit.limiter = Some(limiter);
        Ok(permit)
    }

    /// Report a successful request for `key`
    pub fn record_success(&self, key: &HostKey) {
        self.global.record_success();
        self.limiter(key).record_success();
    }

    /// Report a failed request for `key`
    pub fn record_failure(&self, key: &HostKey) {
        self.global.record_failure();
        self.limiter(key).record_failure();
    }

    /// Status of every limiter, the global one included under [`GLOBAL_KEY`]
    #[must_use]
    pub fn statuses(&self) -> HashMap<String, RateLimitStatus> {
        let mut statuses: HashMap<_, _> = self
            .limiters
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().status()))
            .collect();
        statuses.insert(GLOBAL_KEY.to_string(), self.global.status());
        statuses
    }

    /// Number of per-key limiters created so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no per-key limiter has been created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Remove the limiter of `key`. It will be recreated with fresh state on
    /// next use.
    pub fn remove(&self, key: &HostKey) -> bool {
        self.limiters.remove(key).is_some()
    }

    fn config_for(&self, key: &HostKey) -> &RateLimitConfig {
        self.key_configs
            .get(key.as_str())
            .unwrap_or(&self.default_config)
    }
}
