//! Pulls the data needed to solve a challenge out of its page.
//!
//! Challenge pages are small and generated from a handful of templates, so
//! targeted patterns are enough; no HTML parser is involved.

use http::{HeaderMap, Method};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

static RAY_ID_IN_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?ix)
        (?:ray\s*id:?\s*(?:<[^>]+>\s*)*([0-9a-f]{16})   # footer text
        | cRay\s*:\s*['"]([0-9a-f]+)['"]                # challenge options
        | data-ray=["']([0-9a-f]+)["'])                 # attribute
        "#,
    )
    .expect("ray id regex should be valid")
});

static SITE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:data-sitekey=["']|sitekey['"]?\s*:\s*['"])([\w-]+)["']"#)
        .expect("site key regex should be valid")
});

static FORM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<form\b([^>]*)>(.*?)</form>").expect("form regex should be valid")
});

static INPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<input\b([^>]*)/?>").expect("input regex should be valid"));

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+))"#)
        .expect("attribute regex should be valid")
});

static SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>(.*?)</script>").expect("script regex should be valid")
});

static TIMEOUT_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)setTimeout\(\s*function\s*\(\s*\)\s*\{(.*)\}\s*,\s*(\d+)\s*\)")
        .expect("setTimeout regex should be valid")
});

/// The challenge form of a page
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChallengeForm {
    /// Raw `action` attribute, entities decoded
    pub action: Option<String>,
    /// `method` attribute, absent means `GET`
    pub method: Option<Method>,
    /// Hidden inputs by name
    pub fields: BTreeMap<String, String>,
}

/// Ray id from the `cf-ray` header or, failing that, the page
#[must_use]
pub fn ray_id(headers: &HeaderMap, body: &str) -> Option<String> {
    if let Some(ray) = headers
        .get("cf-ray")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ray| !ray.is_empty())
    {
        return Some(ray.to_string());
    }
    let captures = RAY_ID_IN_BODY.captures(body)?;
    (1..=3)
        .find_map(|group| captures.get(group))
        .map(|m| m.as_str().to_string())
}

/// Site key of a widget challenge
#[must_use]
pub fn site_key(body: &str) -> Option<String> {
    SITE_KEY
        .captures(body)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// The form with id `challenge-form`, or the first form carrying hidden
/// inputs
#[must_use]
pub fn challenge_form(body: &str) -> Option<ChallengeForm> {
    let mut fallback = None;
    for captures in FORM.captures_iter(body) {
        let attributes = attributes(captures.get(1).map_or("", |m| m.as_str()));
        let form = ChallengeForm {
            action: attributes.get("action").map(|action| decode_entities(action)),
            method: attributes
                .get("method")
                .and_then(|method| method.to_ascii_uppercase().parse().ok()),
            fields: hidden_inputs(captures.get(2).map_or("", |m| m.as_str())),
        };
        if attributes.get("id").is_some_and(|id| id == "challenge-form") {
            return Some(form);
        }
        if fallback.is_none() && !form.fields.is_empty() {
            fallback = Some(form);
        }
    }
    fallback
}

/// Body of the inline script containing the `setTimeout` challenge code
#[must_use]
pub fn challenge_script(body: &str) -> Option<String> {
    SCRIPT
        .captures_iter(body)
        .filter_map(|captures| captures.get(1))
        .map(|m| m.as_str())
        .find(|script| TIMEOUT_BODY.is_match(script))
        .map(str::to_string)
}

/// Code inside `setTimeout(function(){ ... }, ms)` and the declared delay
#[must_use]
pub fn timeout_body(script: &str) -> Option<(String, Duration)> {
    let captures = TIMEOUT_BODY.captures(script)?;
    let code = captures.get(1)?.as_str().to_string();
    // only overflow can fail the parse, saturate then
    let millis = captures.get(2)?.as_str().parse().unwrap_or(u64::MAX);
    Some((code, Duration::from_millis(millis)))
}

fn attributes(tag: &str) -> BTreeMap<String, String> {
    ATTRIBUTE
        .captures_iter(tag)
        .filter_map(|captures| {
            let name = captures.get(1)?.as_str().to_ascii_lowercase();
            let value = (2..=4).find_map(|group| captures.get(group))?.as_str();
            Some((name, value.to_string()))
        })
        .collect()
}

fn hidden_inputs(form_body: &str) -> BTreeMap<String, String> {
    INPUT
        .captures_iter(form_body)
        .filter_map(|captures| {
            let attributes = attributes(captures.get(1)?.as_str());
            if !attributes
                .get("type")
                .is_some_and(|kind| kind.eq_ignore_ascii_case("hidden"))
            {
                return None;
            }
            let name = attributes.get("name")?.clone();
            let value = attributes
                .get("value")
                .map(|value| decode_entities(value))
                .unwrap_or_default();
            Some((name, value))
        })
        .collect()
}

fn decode_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use pretty_assertions::assert_eq;

    const FORM_PAGE: &str = r#"
        <form class="other"><input type="text" name="q"/></form>
        <form id="challenge-form" action="/cdn-cgi/l/chk_jschl?__cf_chl_tk=a&amp;b=1" method="post">
            <input type="hidden" name="r" value="abc&quot;def"/>
            <input type='hidden' name='jschl_vc' value='abc123'/>
            <input type="hidden" name="pass" value="1620000000.123-xyz"/>
            <input type="hidden" id="jschl-answer" name="jschl_answer"/>
            <input type="submit" name="go" value="Go"/>
        </form>"#;

    #[test]
    fn test_challenge_form() {
        let form = challenge_form(FORM_PAGE).unwrap();
        assert_eq!(form.action.as_deref(), Some("/cdn-cgi/l/chk_jschl?__cf_chl_tk=a&b=1"));
        assert_eq!(form.method, Some(Method::POST));
        assert_eq!(
            form.fields,
            BTreeMap::from([
                ("jschl_answer".to_string(), String::new()),
                ("jschl_vc".to_string(), "abc123".to_string()),
                ("pass".to_string(), "1620000000.123-xyz".to_string()),
                ("r".to_string(), "abc\"def".to_string()),
            ])
        );
    }

    #[test]
    fn test_form_without_id_falls_back_to_hidden_inputs() {
        let body = r#"<form action="/verify"><input type="hidden" name="k" value="v"></form>"#;
        let form = challenge_form(body).unwrap();
        assert_eq!(form.action.as_deref(), Some("/verify"));
        assert_eq!(form.method, None);
        assert_eq!(form.fields["k"], "v");

        assert_eq!(challenge_form("<form><input name=q></form>"), None);
    }

    #[test]
    fn test_ray_id() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            ray_id(&headers, "Cloudflare Ray ID: <strong>7d2f1c3b4a5e6f70</strong>").as_deref(),
            Some("7d2f1c3b4a5e6f70")
        );
        assert_eq!(
            ray_id(&headers, "window._cf_chl_opt={cRay: '8a1b2c3d4e5f6a7b'}").as_deref(),
            Some("8a1b2c3d4e5f6a7b")
        );
        assert_eq!(ray_id(&headers, "nothing here"), None);

        headers.insert("cf-ray", HeaderValue::from_static("8a1b2c3d4e5f6a7b-FRA"));
        assert_eq!(ray_id(&headers, "").as_deref(), Some("8a1b2c3d4e5f6a7b-FRA"));
    }

    #[test]
    fn test_site_key() {
        assert_eq!(
            site_key(r#"<div class="cf-turnstile" data-sitekey="0x4AAAAAAADnPIDROrmt1Wwj"></div>"#)
                .as_deref(),
            Some("0x4AAAAAAADnPIDROrmt1Wwj")
        );
        assert_eq!(
            site_key("turnstile.render('#w', { sitekey: '1x00000000000000000000AA' })").as_deref(),
            Some("1x00000000000000000000AA")
        );
    }

    #[test]
    fn test_challenge_script_and_timeout() {
        let body = r#"<script>var x = 1;</script>
            <script type="text/javascript">
              setTimeout(function(){
                var a = 10; a += 5;
                f.submit();
              }, 4000);
            </script>"#;
        let script = challenge_script(body).unwrap();
        let (code, delay) = timeout_body(&script).unwrap();
        assert!(code.contains("a += 5"));
        assert!(code.contains("f.submit()"));
        assert_eq!(delay, Duration::from_millis(4000));
        assert_eq!(challenge_script("<script>var x = 1;</script>"), None);
    }
}
