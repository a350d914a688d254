use axum::http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::config::SecurityConfig;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("content type not allowed")]
    UnsupportedContentType,
    #[error("request body too large")]
    InputTooLarge,
    #[error("request matched malicious pattern '{0}'")]
    Malicious(&'static str),
}

/// Patterns that mark a request as malicious. Matched against the raw
/// stringified body and query before sanitization removes the evidence.
static MALICIOUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "code-exec",
            Regex::new(r"(?i)\b(eval|exec|system|shell_exec|passthru)\s*\(").expect("pattern"),
        ),
        ("script-tag", Regex::new(r"(?i)<script").expect("pattern")),
        ("javascript-url", Regex::new(r"(?i)javascript:").expect("pattern")),
        ("data-html-url", Regex::new(r"(?i)data:text/html").expect("pattern")),
        ("shell-substitution", Regex::new(r"\$\{[^}]*\}").expect("pattern")),
    ]
});

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("pattern"));
static SCRIPT_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)javascript:|data:text/html").expect("pattern"));
static SQL_VERB_IN_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(select|union|insert|update|delete|drop)\b").expect("pattern")
});

/// Shared with the output filter, which replaces matches with a sentinel.
pub(crate) fn malicious_patterns() -> &'static [(&'static str, Regex)] {
    &MALICIOUS_PATTERNS
}

pub fn check_content_type(headers: &HeaderMap, config: &SecurityConfig) -> Result<(), SecurityError> {
    let Some(value) = headers.get(axum::http::header::CONTENT_TYPE) else {
        // Bodyless requests (GET/DELETE) carry no content type.
        return Ok(());
    };
    let raw = value
        .to_str()
        .map_err(|_| SecurityError::UnsupportedContentType)?;
    let essence = raw.split(';').next().unwrap_or("").trim();
    if config
        .allowed_content_types
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    {
        Ok(())
    } else {
        Err(SecurityError::UnsupportedContentType)
    }
}

/// Scan the raw request text for the malicious pattern list.
pub fn scan_for_malicious(text: &str) -> Result<(), SecurityError> {
    for (name, pattern) in MALICIOUS_PATTERNS.iter() {
        if pattern.is_match(text) {
            return Err(SecurityError::Malicious(name));
        }
    }
    Ok(())
}

/// Entities the escape step emits. A `&` starting any of these is left
/// alone on re-application, which is what keeps the transform idempotent.
const KNOWN_ENTITIES: &[&str] = &["&amp;", "&lt;", "&gt;", "&quot;", "&#39;", "&#45;", "&#47;"];

/// Neutralize one string: HTML tags are stripped and script URLs removed,
/// the XSS-dangerous characters are escaped to HTML entities, and the SQL
/// comment tokens are quoted into numeric entities.
fn sanitize_str(input: &str) -> String {
    let stripped = HTML_TAG.replace_all(input, "");

    // Removing a script URL can splice its surroundings into a new one
    // ("javajavascript:script:"), so removal runs to a fixed point.
    let mut text = stripped.into_owned();
    loop {
        let next = SCRIPT_URL.replace_all(&text, "").into_owned();
        if next == text {
            break;
        }
        text = next;
    }

    escape_dangerous(&text)
        .replace("--", "&#45;&#45;")
        .replace("/*", "&#47;*")
        .replace("*/", "*&#47;")
}

fn escape_dangerous(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(ch) = rest.chars().next() {
        match ch {
            '&' => {
                if KNOWN_ENTITIES.iter().any(|entity| rest.starts_with(entity)) {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
            }
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

/// Recursively sanitize a JSON document in place. Object keys are rewritten
/// as plain strings; they are never trusted into field lookups.
pub fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(text) => {
            *text = sanitize_str(text);
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize_value(item);
            }
        }
        Value::Object(map) => {
            let mut replacement = serde_json::Map::with_capacity(map.len());
            for (key, mut entry) in std::mem::take(map) {
                sanitize_value(&mut entry);
                replacement.insert(sanitize_str(&key), entry);
            }
            *map = replacement;
        }
        _ => {}
    }
}

/// Heuristic suspicion score for one request; compared against the
/// configured threshold by the caller.
pub struct SuspicionInput<'a> {
    pub headers: &'a HeaderMap,
    pub path_and_query: &'a str,
    pub body_len: usize,
    /// Time since the previous request from the same IP, when known.
    pub gap_ms: Option<u64>,
}

const PROXY_HEADERS: &[&str] = &[
    "via",
    "x-originating-ip",
    "x-remote-ip",
    "x-remote-addr",
    "x-proxyuser-ip",
];

pub fn suspicion_score(input: &SuspicionInput<'_>, config: &SecurityConfig) -> u32 {
    let mut score = 0;

    for name in PROXY_HEADERS {
        if input.headers.contains_key(*name) {
            score += 10;
        }
    }

    match input
        .headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        None => score += 15,
        Some(agent) => {
            let lowered = agent.to_lowercase();
            if agent.len() < 10
                || lowered.contains("bot")
                || lowered.contains("curl")
                || lowered.contains("python")
            {
                score += 15;
            }
        }
    }

    if let Some(gap_ms) = input.gap_ms {
        if gap_ms < config.min_request_spacing_ms {
            score += 10;
        }
    }

    if input.body_len > 100 * 1024 {
        score += 20;
    }

    if input.path_and_query.contains("../") {
        score += 30;
    }

    if SQL_VERB_IN_URL.is_match(input.path_and_query) {
        score += 25;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn security_config() -> SecurityConfig {
        crate::config::GatewayConfig::from_env()
            .expect("config")
            .security
    }

    #[test]
    fn content_type_allow_list() {
        let config = security_config();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        assert!(check_content_type(&headers, &config).is_ok());

        headers.insert(
            axum::http::header::CONTENT_TYPE,
            "application/xml".parse().unwrap(),
        );
        assert!(matches!(
            check_content_type(&headers, &config),
            Err(SecurityError::UnsupportedContentType)
        ));
    }

    #[test]
    fn malicious_patterns_detected() {
        assert!(scan_for_malicious("please eval(this)").is_err());
        assert!(scan_for_malicious("<script>alert(1)</script>").is_err());
        assert!(scan_for_malicious("javascript:void(0)").is_err());
        assert!(scan_for_malicious("${IFS}cat /etc/passwd").is_err());
        assert!(scan_for_malicious("write me a poem about evaluation").is_ok());
    }

    #[test]
    fn sanitize_strips_html_and_quotes_sql_tokens() {
        let mut doc = json!({
            "prompt": "<b>hello</b> world -- drop it",
            "nested": {"<script>k</script>": "javascript:alert(1)"}
        });
        sanitize_value(&mut doc);
        assert_eq!(doc["prompt"], "hello world &#45;&#45; drop it");
        let keys: Vec<&String> = doc["nested"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["k"]);
        assert_eq!(doc["nested"]["k"], "alert(1)");
    }

    #[test]
    fn sanitize_escapes_dangerous_characters() {
        let mut doc = json!({
            "name": "O'Brien says \"hi\" & asks 1 < 2",
            "note": "a /* b */ c"
        });
        sanitize_value(&mut doc);
        assert_eq!(doc["name"], "O&#39;Brien says &quot;hi&quot; &amp; asks 1 &lt; 2");
        assert_eq!(doc["note"], "a &#47;* b *&#47; c");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let mut doc = json!({
            "a": "<i>x</i> -- y ${b} < & \"q\" 'p'",
            "list": ["<script>", {"k<>": "data:text/html,boo"}],
            "splice": "javajavascript:script:alert(1) */* ---"
        });
        sanitize_value(&mut doc);
        let once = doc.clone();
        sanitize_value(&mut doc);
        assert_eq!(doc, once);
        // The spliced script URL never survives either pass.
        assert!(!doc["splice"].as_str().unwrap().contains("javascript:"));
    }

    #[test]
    fn suspicion_scoring_accumulates() {
        let config = security_config();
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::USER_AGENT, "curl/8.0".parse().unwrap());
        headers.insert("via", "1.1 proxy".parse().unwrap());
        let input = SuspicionInput {
            headers: &headers,
            path_and_query: "/v1/completions?q=../../etc/passwd",
            body_len: 200 * 1024,
            gap_ms: Some(100),
        };
        let score = suspicion_score(&input, &config);
        // proxy 10 + bot UA 15 + spacing 10 + oversized 20 + traversal 30
        assert_eq!(score, 85);
        assert!(score > config.suspicion_score_threshold);
    }

    #[test]
    fn quiet_request_scores_low() {
        let config = security_config();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::USER_AGENT,
            "Mozilla/5.0 (Macintosh; Intel Mac OS X)".parse().unwrap(),
        );
        let input = SuspicionInput {
            headers: &headers,
            path_and_query: "/v1/chat/completions",
            body_len: 512,
            gap_ms: Some(5_000),
        };
        assert!(suspicion_score(&input, &config) < config.suspicion_score_threshold);
    }
}
