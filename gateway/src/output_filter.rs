use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::SecurityConfig;
use crate::sanitize::malicious_patterns;

pub const FILTER_SENTINEL: &str = "[FILTERED]";

/// Response-extension marker set by the two mint surfaces (key creation and
/// the OAuth callback), whose whole purpose is returning a fresh secret.
#[derive(Debug, Clone, Copy)]
pub struct SkipOutputFilter;

/// Token accounting fields of the completion contract; their names contain
/// "token" but they are counters, not secrets.
const TOKEN_COUNT_KEYS: &[&str] = &[
    "prompt_tokens",
    "completion_tokens",
    "total_tokens",
    "input_tokens",
    "output_tokens",
    "max_tokens",
    "tokens",
];

/// Substrings that mark a JSON key as secret-bearing.
const SENSITIVE_KEY_PARTS: &[&str] = &[
    "password",
    "secret",
    "key",
    "token",
    "auth",
    "credential",
    "private",
    "hash",
    "salt",
    "signature",
    "certificate",
];

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Za-z0-9._%+-]{1,2})[A-Za-z0-9._%+-]*@([A-Za-z0-9.-]+\.[A-Za-z]{2,})\b")
        .expect("pattern")
});
static CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{4}[ -]?){3}(\d{4})\b").expect("pattern"));
static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("pattern"));
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\+?\d{1,3}[-. ]?\(?\d{3}\)?[-. ]?\d{3}[-. ]?(\d{4})\b").expect("pattern")
});
static CREDENTIAL_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|passwd|secret|token|api[_-]?key|authorization)\s*[=:]\s*[^\s,;&]+")
        .expect("pattern")
});

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    if TOKEN_COUNT_KEYS.contains(&lowered.as_str()) {
        return false;
    }
    SENSITIVE_KEY_PARTS
        .iter()
        .any(|part| lowered.contains(part))
}

/// Mask a secret-bearing value: first four characters survive, nothing else.
fn mask_secret(value: &Value) -> Value {
    match value {
        Value::String(text) if text.chars().count() > 4 => {
            let prefix: String = text.chars().take(4).collect();
            Value::String(format!("{prefix}****"))
        }
        _ => Value::String("***".to_string()),
    }
}

fn mask_pii_str(input: &str) -> String {
    let mut out = CREDENTIAL_ASSIGNMENT
        .replace_all(input, |caps: &regex::Captures<'_>| {
            format!("{}={}", &caps[1], FILTER_SENTINEL)
        })
        .into_owned();

    for (_, pattern) in malicious_patterns() {
        out = pattern.replace_all(&out, FILTER_SENTINEL).into_owned();
    }

    out = CARD
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            format!("****-****-****-{}", &caps[1])
        })
        .into_owned();
    out = SSN.replace_all(&out, "***-**-****").into_owned();
    out = PHONE
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            format!("***-***-{}", &caps[1])
        })
        .into_owned();
    out = EMAIL
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            format!("{}***@{}", &caps[1], &caps[2])
        })
        .into_owned();
    out
}

/// Output stage: walk every JSON response body, mask PII in string values,
/// blank out secret-bearing keys, and replace dangerous code patterns with
/// the sentinel. Applying the filter twice produces the same output.
pub fn filter_response(value: &mut Value, config: &SecurityConfig) {
    match value {
        Value::String(text) => {
            if config.mask_pii {
                *text = mask_pii_str(text);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                filter_response(item, config);
            }
        }
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if config.mask_sensitive_keys && is_sensitive_key(key) {
                    *entry = mask_secret(entry);
                } else {
                    filter_response(entry, config);
                }
            }
        }
        _ => {}
    }
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
    fn masks_credential_assignments_in_content() {
        let config = security_config();
        let mut doc = json!({
            "choices": [{"message": {"role": "assistant", "content": "use password=hunter2 to log in"}}]
        });
        filter_response(&mut doc, &config);
        let content = doc["choices"][0]["message"]["content"].as_str().unwrap();
        assert!(content.contains(FILTER_SENTINEL));
        assert!(!content.contains("hunter2"));
    }

    #[test]
    fn masks_pii_shapes() {
        let config = security_config();
        let mut doc = json!({
            "text": "mail john.doe@example.com or call +1 (415) 555-0100, card 4111 1111 1111 1111, ssn 078-05-1120"
        });
        filter_response(&mut doc, &config);
        let text = doc["text"].as_str().unwrap();
        assert!(text.contains("jo***@example.com"));
        assert!(!text.contains("john.doe@"));
        assert!(text.contains("****-****-****-1111"));
        assert!(text.contains("***-**-****"));
        assert!(!text.contains("078-05-1120"));
        assert!(!text.contains("555-0100"));
    }

    #[test]
    fn masks_sensitive_keys_keeping_four_chars() {
        let config = security_config();
        let mut doc = json!({
            "api_key": "autogram_sk_test_abcdef",
            "nested": {"authToken": "abcd1234", "count": 7},
            "salt": 12345
        });
        filter_response(&mut doc, &config);
        assert_eq!(doc["api_key"], "auto****");
        assert_eq!(doc["nested"]["authToken"], "abcd****");
        assert_eq!(doc["nested"]["count"], 7);
        assert_eq!(doc["salt"], "***");
    }

    #[test]
    fn token_counters_survive_the_filter() {
        let config = security_config();
        let mut doc = json!({
            "usage": {"prompt_tokens": 12000, "completion_tokens": 512, "total_tokens": 12512}
        });
        filter_response(&mut doc, &config);
        assert_eq!(doc["usage"]["total_tokens"], 12512);
    }

    #[test]
    fn filter_is_idempotent() {
        let config = security_config();
        let mut doc = json!({
            "api_key": "autogram_sk_test_abcdef",
            "report": "password=hunter2; email a.b@example.org; eval(payload)",
            "choices": [{"text": "card 4111-1111-1111-1111 and ssn 078-05-1120"}],
            "hash": "deadbeefdeadbeef"
        });
        filter_response(&mut doc, &config);
        let once = doc.clone();
        filter_response(&mut doc, &config);
        assert_eq!(doc, once);
    }

    #[test]
    fn no_unmasked_secret_longer_than_four_chars() {
        let config = security_config();
        let mut doc = json!({
            "password": "super-secret-value",
            "refresh_token": "abcdefghijklmnop"
        });
        filter_response(&mut doc, &config);
        for value in doc.as_object().unwrap().values() {
            let text = value.as_str().unwrap();
            let unmasked: String = text.chars().filter(|ch| *ch != '*').collect();
            assert!(unmasked.chars().count() <= 4, "value {text} leaks");
        }
    }
}
