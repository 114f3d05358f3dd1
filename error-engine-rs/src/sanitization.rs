//! # Payload Sanitization
//!
//! Strips credentials and personal data from request/response payloads and
//! free-text messages before they are attached to error records or sent to
//! notification channels.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

// Patterns for credentials embedded in free text
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // key=value style credentials
        r"(?i)(api[_-]?key|token|secret|password|credential)s?[\x22']?\s*[=:]\s*[\x22']?([^\x22'\s]+)",
        // Bearer tokens
        r"(?i)bearer\s+([a-zA-Z0-9\._\-]+)",
        // JWTs
        r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+",
        // Email addresses
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

// Header names removed from captured requests and responses
static SENSITIVE_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["authorization", "cookie", "set-cookie", "x-api-key", "proxy-authorization", "x-auth-token"]
        .into_iter()
        .collect()
});

// Field name fragments whose values are never kept
static SENSITIVE_KEYS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "password", "passwd", "secret", "token", "api_key", "apikey", "credential",
        "private_key", "ssn", "credit_card", "card_number", "cvv", "cookie",
    ]
});

/// Determines if a field name holds sensitive data
pub fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();

    if SENSITIVE_HEADERS.contains(key_lower.as_str()) {
        return true;
    }

    SENSITIVE_KEYS.iter().any(|sensitive| key_lower.contains(sensitive))
}

/// Redacts credentials embedded in a free-text message
pub fn sanitize_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        sanitized = pattern
            .replace_all(&sanitized, |caps: &regex::Captures| {
                if caps.len() > 2 {
                    // Keep the key name but redact the value
                    format!("{}={}", &caps[1], REDACTED)
                } else if caps.len() == 2 && caps[0].to_lowercase().starts_with("bearer") {
                    format!("Bearer {}", REDACTED)
                } else {
                    REDACTED.to_string()
                }
            })
            .to_string();
    }

    sanitized
}

/// Returns a copy of a JSON payload with sensitive headers and fields removed.
///
/// Objects are walked recursively; sensitive keys are replaced by
/// `[REDACTED]` rather than dropped so the payload shape stays recognizable.
pub fn sanitize_payload(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut clean = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if is_sensitive_key(key) {
                    clean.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    clean.insert(key.clone(), sanitize_payload(value));
                }
            }
            Value::Object(clean)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_payload).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_message() {
        let sensitive = "Failed to connect with api_key=abc123xyz";
        assert_eq!(sanitize_message(sensitive), "Failed to connect with api_key=[REDACTED]");

        let bearer = "upstream rejected Bearer abc.def-ghi";
        assert_eq!(sanitize_message(bearer), "upstream rejected Bearer [REDACTED]");

        let email = "duplicate account for jane@example.com";
        assert_eq!(sanitize_message(email), "duplicate account for [REDACTED]");
    }

    #[test]
    fn test_is_sensitive_key() {
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("Set-Cookie"));
        assert!(is_sensitive_key("user_password"));
        assert!(is_sensitive_key("refreshToken"));

        assert!(!is_sensitive_key("username"));
        assert!(!is_sensitive_key("workoutId"));
        assert!(!is_sensitive_key("content-type"));
    }

    #[test]
    fn test_sanitize_request_payload() {
        let request = json!({
            "method": "POST",
            "url": "/api/workouts",
            "headers": {
                "authorization": "Bearer secret",
                "cookie": "sid=1",
                "content-type": "application/json"
            },
            "body": {
                "email": "a@b.co",
                "password": "hunter2",
                "sets": [{ "reps": 10, "token": "x" }]
            }
        });

        let clean = sanitize_payload(&request);

        assert_eq!(clean["headers"]["authorization"], REDACTED);
        assert_eq!(clean["headers"]["cookie"], REDACTED);
        assert_eq!(clean["headers"]["content-type"], "application/json");
        assert_eq!(clean["body"]["password"], REDACTED);
        assert_eq!(clean["body"]["sets"][0]["token"], REDACTED);
        assert_eq!(clean["body"]["sets"][0]["reps"], 10);
        assert_eq!(clean["url"], "/api/workouts");
    }
}
