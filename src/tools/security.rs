use once_cell::sync::Lazy;
use regex::RegexSet;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config;

pub const REDACTION_PLACEHOLDER: &str = "[REDACTED]";

#[derive(Debug, Error)]
pub enum UrlValidationError {
    #[error("URL must be a non-empty string")]
    Empty,
    #[error("invalid URL format: {0}")]
    Malformed(#[from] url::ParseError),
    #[error("URL scheme '{scheme}' not allowed (allowed: {allowed})")]
    SchemeNotAllowed { scheme: String, allowed: String },
    #[error("URL host '{host}' not in allow-list")]
    HostNotAllowed { host: String },
    #[error("URL points to localhost or a private address: {host}")]
    PrivateAddress { host: String },
}

static SECRET_KEY_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)password",
        r"(?i)passwd",
        r"(?i)secret",
        r"(?i)api[_-]?key",
        r"(?i)apikey",
        r"(?i)token",
        r"(?i)auth[_-]?token",
        r"(?i)access[_-]?token",
        r"(?i)refresh[_-]?token",
        r"(?i)credential",
        r"(?i)private[_-]?key",
        r"(?i)privatekey",
        r"(?i)apisecret",
        r"(?i)client[_-]?secret",
        r"(?i)bearer",
        r"(?i)authorization",
        r"(?i)x-api-key",
        r"(?i)x-auth-token",
    ])
    .expect("secret key patterns")
});

fn is_secret_key(key: &str) -> bool {
    SECRET_KEY_PATTERNS.is_match(key)
}

/// Returns a redacted copy of `payload`. Values under keys matching the
/// secret-name patterns become `[REDACTED]`; the input is never mutated.
pub fn redact_secrets(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if is_secret_key(key) {
                    redacted.insert(key.clone(), Value::String(REDACTION_PLACEHOLDER.into()));
                } else {
                    redacted.insert(key.clone(), redact_secrets(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_secrets).collect()),
        other => other.clone(),
    }
}

/// Safe copy of HTTP headers for logging. Sensitive header values are masked
/// down to their last four characters.
pub fn mask_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(key, value)| {
            if is_secret_key(key) {
                (key.clone(), mask_secret(value))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

pub fn mask_secret(value: &str) -> String {
    if value.len() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", &value[value.len() - 4..])
    }
}

/// Validate a tool endpoint URL against the configured scheme and host
/// allow-lists. Localhost and RFC1918 hosts are blocked unless the allow-list
/// names them.
pub fn validate_url(
    raw_url: &str,
    allowed_domains: Option<&[String]>,
    allowed_schemes: &[String],
) -> Result<(), UrlValidationError> {
    if raw_url.trim().is_empty() {
        return Err(UrlValidationError::Empty);
    }
    let parsed = Url::parse(raw_url)?;

    let scheme = parsed.scheme().to_lowercase();
    if !allowed_schemes.iter().any(|allowed| allowed == &scheme) {
        return Err(UrlValidationError::SchemeNotAllowed {
            scheme,
            allowed: allowed_schemes.join(", "),
        });
    }

    let host = parsed.host_str().unwrap_or_default().to_lowercase();

    if let Some(domains) = allowed_domains {
        let allowed = domains.iter().any(|candidate| {
            if let Some(base) = candidate.strip_prefix("*.") {
                host == base || host.ends_with(&format!(".{base}"))
            } else {
                candidate.eq_ignore_ascii_case(&host)
            }
        });
        if !allowed {
            return Err(UrlValidationError::HostNotAllowed { host });
        }
        return Ok(());
    }

    // No allow-list configured: still refuse loopback and private ranges.
    if is_private_host(&host) {
        return Err(UrlValidationError::PrivateAddress { host });
    }
    Ok(())
}

pub fn validate_url_from_env(raw_url: &str) -> Result<(), UrlValidationError> {
    validate_url(
        raw_url,
        config::TOOL_ALLOWED_DOMAINS.as_deref(),
        &config::TOOL_ALLOWED_SCHEMES,
    )
}

fn is_private_host(host: &str) -> bool {
    if host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]" {
        return true;
    }
    host.starts_with("192.168.") || host.starts_with("10.") || host.starts_with("172.16.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_nested_secret_keys() {
        let payload = json!({
            "user": "ops",
            "api_key": "sk-live-12345",
            "nested": {"refresh_token": "abc", "note": "keep"},
            "items": [{"client_secret": "xyz"}, {"plain": 1}],
        });
        let redacted = redact_secrets(&payload);
        assert_eq!(redacted["api_key"], REDACTION_PLACEHOLDER);
        assert_eq!(redacted["nested"]["refresh_token"], REDACTION_PLACEHOLDER);
        assert_eq!(redacted["nested"]["note"], "keep");
        assert_eq!(redacted["items"][0]["client_secret"], REDACTION_PLACEHOLDER);
        assert_eq!(redacted["items"][1]["plain"], 1);
        // original untouched
        assert_eq!(payload["api_key"], "sk-live-12345");
    }

    #[test]
    fn wildcard_domains_match_subdomains() {
        let domains = vec!["*.example.com".to_string()];
        let schemes = vec!["https".to_string()];
        assert!(validate_url("https://api.example.com/run", Some(&domains), &schemes).is_ok());
        assert!(validate_url("https://example.com/run", Some(&domains), &schemes).is_ok());
        assert!(validate_url("https://evil.com/run", Some(&domains), &schemes).is_err());
    }

    #[test]
    fn scheme_allow_list_rejects_http_by_default() {
        let domains = vec!["api.example.com".to_string()];
        let schemes = vec!["https".to_string()];
        let err = validate_url("http://api.example.com/x", Some(&domains), &schemes).unwrap_err();
        assert!(matches!(err, UrlValidationError::SchemeNotAllowed { .. }));
    }

    #[test]
    fn localhost_blocked_without_explicit_listing() {
        let schemes = vec!["https".to_string()];
        let err = validate_url("https://localhost/x", None, &schemes).unwrap_err();
        assert!(matches!(err, UrlValidationError::PrivateAddress { .. }));
        let domains = vec!["localhost".to_string()];
        assert!(validate_url("https://localhost/x", Some(&domains), &schemes).is_ok());
    }

    #[test]
    fn header_masking_keeps_last_four() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer sk-live-9876".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        let masked = mask_headers(&headers);
        assert_eq!(masked[0].1, "****9876");
        assert_eq!(masked[1].1, "application/json");
    }
}
