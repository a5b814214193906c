//! Detection tables.
//!
//! Every challenge kind is described by an ordered list of weighted
//! signals. A classifier's confidence is the sum of the weights of the
//! signals present, capped at 1.0. Adding a marker means adding a row.

use http::{HeaderMap, HeaderName, StatusCode};
use regex::Regex;
use std::sync::LazyLock;

use super::ChallengeType;

/// Confidence a classifier needs to be accepted
pub const DETECTION_THRESHOLD: f64 = 0.5;

/// Confidence reported when the edge service is present but no classifier
/// reached the threshold
pub const UNKNOWN_CONFIDENCE: f64 = 0.3;

/// One piece of evidence for a challenge kind
#[derive(Debug)]
pub(crate) enum Signal {
    /// The body matches a pattern
    Body(Regex, f64),
    /// The response has this status code
    Status(StatusCode, f64),
    /// A header is present, optionally with a value matching a pattern
    Header(HeaderName, Option<Regex>, f64),
}

impl Signal {
    /// Whether this piece of evidence is present
    pub(crate) fn is_present(&self, body: &str, headers: &HeaderMap, status: StatusCode) -> bool {
        match self {
            Self::Body(pattern, _) => pattern.is_match(body),
            Self::Status(expected, _) => status == *expected,
            Self::Header(name, pattern, _) => headers.get_all(name).iter().any(|value| {
                pattern.as_ref().is_none_or(|pattern| {
                    value.to_str().is_ok_and(|value| pattern.is_match(value))
                })
            }),
        }
    }

    fn weight_for(&self, body: &str, headers: &HeaderMap, status: StatusCode) -> f64 {
        match self {
            _ if !self.is_present(body, headers, status) => 0.0,
            Self::Body(_, weight) | Self::Status(_, weight) | Self::Header(_, _, weight) => *weight,
        }
    }
}

/// Scores one challenge kind
#[derive(Debug)]
pub(crate) struct Classifier {
    pub(crate) challenge_type: ChallengeType,
    signals: Vec<Signal>,
}

impl Classifier {
    pub(crate) fn confidence(&self, body: &str, headers: &HeaderMap, status: StatusCode) -> f64 {
        self.signals
            .iter()
            .map(|signal| signal.weight_for(body, headers, status))
            .sum::<f64>()
            .min(1.0)
    }
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("detection pattern should be valid")
}

fn body(pattern: &str, weight: f64) -> Signal {
    Signal::Body(regex(pattern), weight)
}

fn header(name: &'static str, value: Option<&str>, weight: f64) -> Signal {
    Signal::Header(HeaderName::from_static(name), value.map(regex), weight)
}

/// Headers only the edge service sets
pub(crate) static EDGE_HEADERS: LazyLock<Vec<Signal>> = LazyLock::new(|| {
    vec![
        header("cf-ray", None, 1.0),
        header("cf-mitigated", None, 1.0),
        header("cf-chl-bypass", None, 1.0),
        header("server", Some(r"(?i)cloudflare"), 1.0),
    ]
});

/// Body markers of the edge service's interstitial pages
pub(crate) static EDGE_BODY: LazyLock<Regex> = LazyLock::new(|| {
    regex(
        r"(?i)cdn-cgi/|__cf_chl_|_cf_chl_opt|jschl[_-]vc|cf-browser-verification|cf-turnstile|challenges\.cloudflare\.com|cloudflare ray id|cf-error-details",
    )
});

/// Classifiers in evaluation order. More specific, structural signals come
/// first; the first one reaching [`DETECTION_THRESHOLD`] wins.
pub(crate) static CLASSIFIERS: LazyLock<Vec<Classifier>> = LazyLock::new(|| {
    vec![
        Classifier {
            challenge_type: ChallengeType::JavaScript,
            signals: vec![
                body(r#"name=["']jschl_vc["']|jschl_vc="#, 0.4),
                body(r"jschl[_-]answer", 0.3),
                body(r"/cdn-cgi/l/chk_jschl", 0.3),
                body(r"setTimeout\(\s*function\s*\(\s*\)", 0.2),
                body(r"(?i)checking your browser before accessing", 0.2),
                body(r#"id=["']challenge-form["']"#, 0.1),
            ],
        },
        Classifier {
            challenge_type: ChallengeType::Turnstile,
            signals: vec![
                body(r"cf-turnstile", 0.5),
                body(r"challenges\.cloudflare\.com/turnstile", 0.4),
                body(r"turnstile\.render\(", 0.3),
                body(r"data-sitekey=", 0.1),
            ],
        },
        Classifier {
            challenge_type: ChallengeType::Managed,
            signals: vec![
                body(r#"cType['"]?\s*:\s*['"]managed['"]"#, 0.5),
                body(r"_cf_chl_opt", 0.3),
                body(r"/cdn-cgi/challenge-platform/h/[a-z]/orchestrate/(?:managed|chl_page)", 0.3),
                body(r"(?i)verify you are human", 0.2),
                body(r"(?i)<title>\s*just a moment\.\.\.\s*</title>", 0.2),
                header("cf-mitigated", Some(r"(?i)^challenge$"), 0.3),
            ],
        },
        Classifier {
            challenge_type: ChallengeType::RateLimited,
            signals: vec![
                Signal::Status(StatusCode::TOO_MANY_REQUESTS, 0.5),
                header("retry-after", None, 0.3),
                body(r"(?i)you are being rate limited", 0.4),
                body(r"(?i)error(?:\s+code)?:?\s*1015\b", 0.4),
            ],
        },
        Classifier {
            challenge_type: ChallengeType::BotFight,
            signals: vec![
                body(r"(?i)bot fight mode", 0.5),
                body(r"/cdn-cgi/challenge-platform/h/[a-z]/scripts/jsd/", 0.3),
                body(r"(?i)automated (?:traffic|requests|access)", 0.3),
                header("set-cookie", Some(r"__cf_bm="), 0.2),
            ],
        },
        Classifier {
            challenge_type: ChallengeType::Blocked,
            signals: vec![
                body(r"(?i)sorry, you have been blocked", 0.5),
                body(r"(?i)attention required!\s*\|\s*cloudflare", 0.3),
                body(r"cf-error-details", 0.2),
                body(r"(?i)access denied", 0.2),
                body(r"(?i)error(?:\s+code)?:?\s*10(?:06|07|08|09|20)\b", 0.4),
                Signal::Status(StatusCode::FORBIDDEN, 0.2),
            ],
        },
    ]
});

/// Separates firewall blocks from other blocks
pub(crate) static FIREWALL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| regex(r"(?i)error(?:\s+code)?:?\s*1020\b|firewall rule"));
