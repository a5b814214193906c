use http::{HeaderMap, StatusCode};

use super::extract;
use super::patterns::{
    CLASSIFIERS, DETECTION_THRESHOLD, EDGE_BODY, EDGE_HEADERS, FIREWALL_MARKER, UNKNOWN_CONFIDENCE,
};
use super::{ChallengeInfo, ChallengeType};
use crate::ratelimit::headers::retry_after;
use crate::types::HttpResponse;

/// Classifies responses into challenge kinds.
///
/// Classification is a pure function of body, headers and status: the
/// same input always yields the same [`ChallengeInfo`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ChallengeDetector;

impl ChallengeDetector {
    /// Create a detector
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Whether the response shows any trace of the edge service
    #[must_use]
    pub fn is_protected(&self, body: &str, headers: &HeaderMap, status: StatusCode) -> bool {
        EDGE_HEADERS
            .iter()
            .any(|signal| signal.is_present(body, headers, status))
            || EDGE_BODY.is_match(body)
    }

    /// Classify a response
    #[must_use]
    pub fn classify(&self, body: &str, headers: &HeaderMap, status: StatusCode) -> ChallengeInfo {
        if !self.is_protected(body, headers, status) {
            return ChallengeInfo::none(status, body);
        }

        let detected = CLASSIFIERS.iter().find_map(|classifier| {
            let confidence = classifier.confidence(body, headers, status);
            (confidence >= DETECTION_THRESHOLD).then_some((classifier.challenge_type, confidence))
        });

        let Some((challenge_type, confidence)) = detected else {
            log::debug!("Protected response ({status}) matched no known challenge");
            let mut info = ChallengeInfo::new(ChallengeType::Unknown, UNKNOWN_CONFIDENCE, status, body);
            info.ray_id = extract::ray_id(headers, body);
            return info;
        };

        let challenge_type = if challenge_type == ChallengeType::Blocked && FIREWALL_MARKER.is_match(body)
        {
            ChallengeType::Firewall
        } else {
            challenge_type
        };
        log::debug!("Detected {challenge_type} challenge with confidence {confidence:.2}");

        let mut info = ChallengeInfo::new(challenge_type, confidence, status, body);
        info.ray_id = extract::ray_id(headers, body);
        match challenge_type {
            ChallengeType::JavaScript => {
                if let Some(form) = extract::challenge_form(body) {
                    info.submit_url = form.action;
                    info.form_method = form.method;
                    info.form_fields = form.fields;
                }
                if let Some(script) = extract::challenge_script(body) {
                    info.page_delay = extract::timeout_body(&script).map(|(_, delay)| delay);
                    info.script = Some(script);
                }
            }
            ChallengeType::Turnstile | ChallengeType::Managed => {
                info.site_key = extract::site_key(body);
                if let Some(form) = extract::challenge_form(body) {
                    info.submit_url = form.action;
                    info.form_method = form.method;
                    info.form_fields = form.fields;
                }
            }
            ChallengeType::RateLimited => info.retry_after = retry_after(headers),
            _ => {}
        }
        info
    }

    /// Classify a response received from a transport
    #[must_use]
    pub fn classify_response(&self, response: &HttpResponse) -> ChallengeInfo {
        self.classify(&response.body, &response.headers, response.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use rstest::rstest;
    use std::time::Duration;

    fn cf_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("cf-ray", HeaderValue::from_static("8a1b2c3d4e5f6a7b-AMS"));
        headers.insert("server", HeaderValue::from_static("cloudflare"));
        headers
    }

    const JS_PAGE: &str = r#"<html><head><title>Just a moment...</title></head><body>
        <div id="cf-browser-verification">Checking your browser before accessing example.com.</div>
        <script type="text/javascript">
          setTimeout(function(){
            var s,t,o,p,b,r,e,a,k,i,n,g,f, answer;
            t = document.createElement('div');
            a = document.getElementById('jschl-answer');
            answer = 10 + 5;
            f = document.getElementById('challenge-form');
            f.submit();
          }, 4000);
        </script>
        <form id="challenge-form" action="/cdn-cgi/l/chk_jschl" method="get">
          <input type="hidden" name="jschl_vc" value="abc123"/>
          <input type="hidden" name="pass" value="1620000000.123-abc"/>
          <input type="hidden" id="jschl-answer" name="jschl_answer"/>
        </form></body></html>"#;

    #[test]
    fn test_unprotected_response() {
        let info = ChallengeDetector::new().classify("<html>hello</html>", &HeaderMap::new(), StatusCode::OK);
        assert_eq!(info.challenge_type, ChallengeType::None);
        assert!(info.confidence.abs() < f64::EPSILON);
        assert!(!info.is_challenge());
    }

    #[test]
    fn test_javascript_challenge_with_extraction() {
        let info = ChallengeDetector::new().classify(JS_PAGE, &cf_headers(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(info.challenge_type, ChallengeType::JavaScript);
        assert!(info.confidence >= DETECTION_THRESHOLD);
        assert_eq!(info.ray_id.as_deref(), Some("8a1b2c3d4e5f6a7b-AMS"));
        assert_eq!(info.submit_url.as_deref(), Some("/cdn-cgi/l/chk_jschl"));
        assert_eq!(info.form_method, Some(http::Method::GET));
        assert_eq!(info.form_fields["jschl_vc"], "abc123");
        assert_eq!(info.page_delay, Some(Duration::from_secs(4)));
        assert!(info.script.unwrap().contains("answer = 10 + 5"));
    }

    #[rstest]
    #[case(
        r#"<div class="cf-turnstile" data-sitekey="0x4AAAAAAA"></div><script src="https://challenges.cloudflare.com/turnstile/v0/api.js"></script>"#,
        StatusCode::FORBIDDEN,
        ChallengeType::Turnstile
    )]
    #[case(
        r"<title>Just a moment...</title><script>window._cf_chl_opt={cType: 'managed'}</script>",
        StatusCode::FORBIDDEN,
        ChallengeType::Managed
    )]
    #[case(
        "<h1>Error 1015</h1><p>You are being rate limited</p>",
        StatusCode::TOO_MANY_REQUESTS,
        ChallengeType::RateLimited
    )]
    #[case(
        "<p>Bot Fight Mode blocked automated traffic</p>",
        StatusCode::FORBIDDEN,
        ChallengeType::BotFight
    )]
    #[case(
        r#"<title>Attention Required! | Cloudflare</title><h1>Sorry, you have been blocked</h1><div id="cf-error-details"></div>"#,
        StatusCode::FORBIDDEN,
        ChallengeType::Blocked
    )]
    #[case(
        r#"<title>Access denied</title><div class="cf-error-details"><h1>Error 1020</h1></div>"#,
        StatusCode::FORBIDDEN,
        ChallengeType::Firewall
    )]
    #[case("<html>Welcome</html>", StatusCode::OK, ChallengeType::Unknown)]
    fn test_classification(
        #[case] body: &str,
        #[case] status: StatusCode,
        #[case] expected: ChallengeType,
    ) {
        let detector = ChallengeDetector::new();
        let info = detector.classify(body, &cf_headers(), status);
        assert_eq!(info.challenge_type, expected);

        let again = detector.classify(body, &cf_headers(), status);
        assert_eq!(info, again);
    }

    #[test]
    fn test_unknown_confidence() {
        let info = ChallengeDetector::new().classify("<html>Welcome</html>", &cf_headers(), StatusCode::OK);
        assert!((info.confidence - UNKNOWN_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rate_limit_with_retry_after() {
        let mut headers = cf_headers();
        headers.insert("retry-after", HeaderValue::from_static("2"));
        let info = ChallengeDetector::new().classify("", &headers, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(info.challenge_type, ChallengeType::RateLimited);
        assert!((info.confidence - 0.8).abs() < 1e-9);
        assert_eq!(info.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_body_marker_alone_marks_protection() {
        let detector = ChallengeDetector::new();
        assert!(detector.is_protected("<a href=\"/cdn-cgi/l/email-protection\">", &HeaderMap::new(), StatusCode::OK));
        assert!(!detector.is_protected("plain", &HeaderMap::new(), StatusCode::OK));
    }

    #[test]
    fn test_turnstile_site_key_extracted() {
        let body = r#"<div class="cf-turnstile" data-sitekey="0x4AAAAAAA"></div>"#;
        let info = ChallengeDetector::new().classify(body, &cf_headers(), StatusCode::FORBIDDEN);
        assert_eq!(info.site_key.as_deref(), Some("0x4AAAAAAA"));
    }
}
