use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

use crate::ErrorKind;

/// Kind of protection a response carries
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ChallengeType {
    /// An ordinary response
    #[default]
    None,
    /// Arithmetic puzzle computed by an inline script
    #[serde(rename = "javascript")]
    #[strum(to_string = "javascript")]
    JavaScript,
    /// Turnstile widget
    Turnstile,
    /// Managed, interactive human check
    Managed,
    /// Rate-limit hold, usually with a `Retry-After` header
    RateLimited,
    /// Bot fight mode interstitial
    BotFight,
    /// Generic block page
    Blocked,
    /// Block page caused by a firewall rule
    Firewall,
    /// Protected by the edge service, but no known challenge matched
    Unknown,
}

impl ChallengeType {
    /// Whether any challenge was detected at all
    #[must_use]
    pub const fn is_challenge(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether this kind can be resolved without an external solver
    #[must_use]
    pub const fn is_solvable(self) -> bool {
        matches!(self, Self::JavaScript | Self::RateLimited)
    }
}

/// Why a challenge was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedReason {
    /// Handling of this challenge kind is switched off
    #[strum(to_string = "handling is disabled")]
    Disabled,
    /// Needs a human or an external CAPTCHA solver
    #[strum(to_string = "unsupported challenge type, no solver available")]
    NoSolverAvailable,
    /// The edge service refuses access outright
    #[strum(to_string = "access is denied, nothing to solve")]
    AccessDenied,
    /// The page could not be classified
    #[strum(to_string = "challenge could not be classified")]
    Unrecognized,
}

/// Result of inspecting one response.
///
/// Built fresh for every response and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChallengeInfo {
    /// Detected challenge kind
    pub challenge_type: ChallengeType,
    /// Confidence of the classification, from 0.0 to 1.0
    pub confidence: f64,
    /// Trace identifier of the edge service
    pub ray_id: Option<String>,
    /// Site key of a widget challenge
    pub site_key: Option<String>,
    /// Where the challenge form submits to, as written in the page
    pub submit_url: Option<String>,
    /// Method of the challenge form
    #[serde(with = "http_serde_method")]
    pub form_method: Option<Method>,
    /// Hidden inputs of the challenge form
    pub form_fields: BTreeMap<String, String>,
    /// Script computing the answer of a JavaScript challenge
    #[serde(skip)]
    pub script: Option<String>,
    /// Wait the page declares before submitting
    #[serde(with = "humantime_serde")]
    pub page_delay: Option<Duration>,
    /// Value of the `Retry-After` header
    #[serde(with = "humantime_serde")]
    pub retry_after: Option<Duration>,
    /// HTTP status of the inspected response
    #[serde(with = "http_serde_status")]
    pub status_code: StatusCode,
    /// Body of the inspected response
    #[serde(skip)]
    pub raw_body: String,
}

impl ChallengeInfo {
    /// A response without any challenge
    #[must_use]
    pub fn none(status_code: StatusCode, body: &str) -> Self {
        Self::new(ChallengeType::None, 0.0, status_code, body)
    }

    pub(crate) fn new(
        challenge_type: ChallengeType,
        confidence: f64,
        status_code: StatusCode,
        body: &str,
    ) -> Self {
        Self {
            challenge_type,
            confidence,
            ray_id: None,
            site_key: None,
            submit_url: None,
            form_method: None,
            form_fields: BTreeMap::new(),
            script: None,
            page_delay: None,
            retry_after: None,
            status_code,
            raw_body: body.to_string(),
        }
    }

    /// Whether a challenge was detected
    #[must_use]
    pub const fn is_challenge(&self) -> bool {
        self.challenge_type.is_challenge()
    }
}

mod http_serde_status {
    use http::StatusCode;
    use serde::Serializer;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(super) fn serialize<S: Serializer>(status: &StatusCode, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(status.as_u16())
    }
}

mod http_serde_method {
    use http::Method;
    use serde::Serializer;

    #[allow(clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(method: &Option<Method>, s: S) -> Result<S::Ok, S::Error> {
        match method {
            Some(method) => s.serialize_some(method.as_str()),
            None => s.serialize_none(),
        }
    }
}

/// Final outcome of resolving one challenged request
#[derive(Debug, Serialize)]
pub struct ChallengeResult {
    /// Whether the challenge was passed
    pub success: bool,
    /// Kind of the challenge first detected
    pub challenge_type: ChallengeType,
    /// Solve attempts made, zero if none was possible
    pub attempts: u32,
    /// Time from detection to the final outcome
    #[serde(with = "humantime_serde")]
    pub total_time: Duration,
    /// Last error of a failed resolution
    pub error: Option<ErrorKind>,
}

impl ChallengeResult {
    pub(crate) const fn solved(challenge_type: ChallengeType, attempts: u32, total_time: Duration) -> Self {
        Self {
            success: true,
            challenge_type,
            attempts,
            total_time,
            error: None,
        }
    }

    pub(crate) const fn failed(
        challenge_type: ChallengeType,
        attempts: u32,
        total_time: Duration,
        error: ErrorKind,
    ) -> Self {
        Self {
            success: false,
            challenge_type,
            attempts,
            total_time,
            error: Some(error),
        }
    }
}
