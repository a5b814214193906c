use serde::Serialize;
use std::fmt;
use url::Url;

use crate::{ErrorKind, Result};

/// Identifies the per-target limiter a request is admitted against.
///
/// Keys are normalized hostnames, so `API.example.com` and
/// `api.example.com` share one limiter while subdomains stay separate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostKey(String);

impl HostKey {
    /// Get the key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&Url> for HostKey {
    type Error = ErrorKind;

    fn try_from(url: &Url) -> Result<Self> {
        url.host_str()
            .map(Self::from)
            .ok_or(ErrorKind::InvalidUrlHost)
    }
}

impl From<&str> for HostKey {
    fn from(host: &str) -> Self {
        Self(host.trim_end_matches('.').to_lowercase())
    }
}

impl From<String> for HostKey {
    fn from(host: String) -> Self {
        Self::from(host.as_str())
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
