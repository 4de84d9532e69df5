//! Error classification
//!
//! One declarative classifier maps every response or transport failure to
//! an action the send loop understands. The default table follows common
//! REST semantics; streams override individual status codes (for example
//! mapping 404 to IGNORE on optional sub-resources) or match on error
//! message substrings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{EngineError, FailureKind, Result};
use crate::http::transport::{HttpResponse, TransportError};

/// What the send loop does with a classified exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// Hand the response to the caller
    Success,
    /// Log and treat as an empty page; the slice advances
    Ignore,
    /// Back off and re-send
    Retry,
    /// Surface a terminal error
    Fail,
}

/// Classification outcome for one exchange
#[derive(Debug, Clone)]
pub struct Classified {
    /// The action to take
    pub action: ResponseAction,
    /// Failure kind for RETRY/FAIL actions
    pub kind: Option<FailureKind>,
    /// Human-readable description, mined from the response body when
    /// possible
    pub message: String,
    /// Server-requested backoff, parsed from the retry header
    pub backoff: Option<Duration>,
}

/// Override for a single status code
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StatusOverride {
    /// Status code this entry applies to
    pub status: u16,
    /// Action replacing the default
    pub action: ResponseAction,
    /// Failure kind replacing the default
    #[serde(default)]
    pub kind: Option<FailureKind>,
    /// Fixed message replacing the mined one
    #[serde(default)]
    pub message: Option<String>,
}

/// Override keyed on an error-message substring
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct MessageOverride {
    /// Case-insensitive substring matched against the mined message
    pub contains: String,
    /// Action replacing the status-based one
    pub action: ResponseAction,
    /// Failure kind replacing the status-based one
    #[serde(default)]
    pub kind: Option<FailureKind>,
}

/// Per-stream classifier configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ErrorMappingConfig {
    /// Status-code overrides merged over the default table
    #[serde(default)]
    pub overrides: Vec<StatusOverride>,

    /// Message-substring overrides, applied after status mapping
    #[serde(default)]
    pub message_overrides: Vec<MessageOverride>,

    /// Header carrying the server-requested backoff in seconds
    #[serde(default = "default_retry_after_header")]
    pub retry_after_header: String,
}

fn default_retry_after_header() -> String {
    "Retry-After".to_string()
}

impl Default for ErrorMappingConfig {
    fn default() -> Self {
        Self {
            overrides: Vec::new(),
            message_overrides: Vec::new(),
            retry_after_header: default_retry_after_header(),
        }
    }
}

/// JSON fields mined for error messages, in walk order
const MESSAGE_FIELDS: &[&str] = &[
    "message", "messages", "error", "errors", "failures", "failure", "detail", "details",
];

/// Maps responses and transport failures to actions
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    by_status: BTreeMap<u16, (ResponseAction, Option<FailureKind>, Option<String>)>,
    message_overrides: Vec<MessageOverride>,
    retry_after_header: String,
}

impl ErrorClassifier {
    /// Build a classifier, merging stream overrides over the default
    /// table exactly once.
    pub fn new(config: &ErrorMappingConfig) -> Result<Self> {
        let mut by_status = BTreeMap::new();
        for entry in &config.overrides {
            if !(100..=599).contains(&entry.status) {
                return Err(EngineError::config(format!(
                    "error mapping override for invalid status code {}",
                    entry.status
                )));
            }
            by_status.insert(
                entry.status,
                (entry.action, entry.kind, entry.message.clone()),
            );
        }
        for entry in &config.message_overrides {
            if entry.contains.is_empty() {
                return Err(EngineError::config(
                    "error mapping message override with empty substring",
                ));
            }
        }
        Ok(Self {
            by_status,
            message_overrides: config.message_overrides.clone(),
            retry_after_header: config.retry_after_header.clone(),
        })
    }

    /// Classify a completed HTTP exchange
    pub fn classify_response(&self, response: &HttpResponse) -> Classified {
        let mined = response
            .json()
            .ok()
            .and_then(|body| extract_error_message(&body))
            .unwrap_or_else(|| format!("HTTP {}", response.status));

        let (mut action, mut kind, fixed_message) = match self.by_status.get(&response.status) {
            Some((action, kind, message)) => {
                let (_, default_kind) = default_mapping(response.status);
                (*action, kind.or(default_kind), message.clone())
            }
            None => {
                let (action, kind) = default_mapping(response.status);
                (action, kind, None)
            }
        };

        let message = fixed_message.unwrap_or(mined);

        let lowered = message.to_ascii_lowercase();
        for entry in &self.message_overrides {
            if lowered.contains(&entry.contains.to_ascii_lowercase()) {
                action = entry.action;
                kind = entry.kind.or(kind);
                break;
            }
        }

        let backoff = if action == ResponseAction::Retry {
            self.retry_after(response)
        } else {
            None
        };

        Classified {
            action,
            kind,
            message,
            backoff,
        }
    }

    /// Classify a network-level failure
    pub fn classify_transport(&self, error: &TransportError) -> Classified {
        if error.is_transient() {
            Classified {
                action: ResponseAction::Retry,
                kind: Some(FailureKind::TransientError),
                message: error.message.clone(),
                backoff: None,
            }
        } else {
            Classified {
                action: ResponseAction::Fail,
                kind: Some(FailureKind::SystemError),
                message: error.message.clone(),
                backoff: None,
            }
        }
    }

    fn retry_after(&self, response: &HttpResponse) -> Option<Duration> {
        response
            .header(&self.retry_after_header)
            .or_else(|| response.header(&format!("X-{}", self.retry_after_header)))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// The default status table
fn default_mapping(status: u16) -> (ResponseAction, Option<FailureKind>) {
    match status {
        200..=299 => (ResponseAction::Success, None),
        400 | 401 | 403 => (ResponseAction::Fail, Some(FailureKind::ConfigError)),
        404 => (ResponseAction::Fail, Some(FailureKind::SystemError)),
        408 | 429 => (ResponseAction::Retry, Some(FailureKind::TransientError)),
        500..=599 => (ResponseAction::Retry, Some(FailureKind::TransientError)),
        _ => (ResponseAction::Fail, Some(FailureKind::SystemError)),
    }
}

/// Walk the well-known error fields recursively, joining every string
/// found. Lists of strings are joined with `; `.
pub fn extract_error_message(body: &serde_json::Value) -> Option<String> {
    let mut parts = Vec::new();
    collect_messages(body, &mut parts, 0);
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

fn collect_messages(value: &serde_json::Value, out: &mut Vec<String>, depth: usize) {
    // Bounded depth; error payloads are shallow in practice
    if depth > 8 {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for field in MESSAGE_FIELDS {
                if let Some(inner) = map.get(*field) {
                    match inner {
                        serde_json::Value::String(s) if !s.is_empty() => out.push(s.clone()),
                        other => collect_messages(other, out, depth + 1),
                    }
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                match item {
                    serde_json::Value::String(s) if !s.is_empty() => out.push(s.clone()),
                    other => collect_messages(other, out, depth + 1),
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(&ErrorMappingConfig::default()).unwrap()
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: body.to_string(),
            url: "https://api.example.com/x".into(),
        }
    }

    #[test]
    fn test_default_table() {
        let c = classifier();
        assert_eq!(
            c.classify_response(&response(200, "{}")).action,
            ResponseAction::Success
        );
        for status in [400u16, 401, 403] {
            let out = c.classify_response(&response(status, "{}"));
            assert_eq!(out.action, ResponseAction::Fail);
            assert_eq!(out.kind, Some(FailureKind::ConfigError));
        }
        let not_found = c.classify_response(&response(404, "{}"));
        assert_eq!(not_found.action, ResponseAction::Fail);
        assert_eq!(not_found.kind, Some(FailureKind::SystemError));
        for status in [408u16, 429, 500, 502, 503] {
            let out = c.classify_response(&response(status, "{}"));
            assert_eq!(out.action, ResponseAction::Retry);
            assert_eq!(out.kind, Some(FailureKind::TransientError));
        }
        let odd = c.classify_response(&response(302, "{}"));
        assert_eq!(odd.action, ResponseAction::Fail);
        assert_eq!(odd.kind, Some(FailureKind::SystemError));
    }

    #[test]
    fn test_status_override_to_ignore() {
        let config = ErrorMappingConfig {
            overrides: vec![StatusOverride {
                status: 404,
                action: ResponseAction::Ignore,
                kind: None,
                message: None,
            }],
            ..Default::default()
        };
        let c = ErrorClassifier::new(&config).unwrap();
        let out = c.classify_response(&response(404, "{}"));
        assert_eq!(out.action, ResponseAction::Ignore);
        // Defaults still apply for untouched codes
        assert_eq!(
            c.classify_response(&response(401, "{}")).action,
            ResponseAction::Fail
        );
    }

    #[test]
    fn test_message_substring_override() {
        let config = ErrorMappingConfig {
            message_overrides: vec![MessageOverride {
                contains: "rate limit".into(),
                action: ResponseAction::Retry,
                kind: Some(FailureKind::TransientError),
            }],
            ..Default::default()
        };
        let c = ErrorClassifier::new(&config).unwrap();
        let out = c.classify_response(&response(403, r#"{"error":"Rate limit exceeded"}"#));
        assert_eq!(out.action, ResponseAction::Retry);
        assert_eq!(out.kind, Some(FailureKind::TransientError));
    }

    #[test]
    fn test_rejects_invalid_overrides() {
        let config = ErrorMappingConfig {
            overrides: vec![StatusOverride {
                status: 42,
                action: ResponseAction::Ignore,
                kind: None,
                message: None,
            }],
            ..Default::default()
        };
        assert!(ErrorClassifier::new(&config).is_err());

        let config = ErrorMappingConfig {
            message_overrides: vec![MessageOverride {
                contains: String::new(),
                action: ResponseAction::Fail,
                kind: None,
            }],
            ..Default::default()
        };
        assert!(ErrorClassifier::new(&config).is_err());
    }

    #[test]
    fn test_retry_after_parsed_only_for_retry() {
        let c = classifier();
        let mut resp = response(429, "{}");
        resp.headers.push(("retry-after".into(), "3".into()));
        let out = c.classify_response(&resp);
        assert_eq!(out.backoff, Some(Duration::from_secs(3)));

        let mut ok = response(200, "{}");
        ok.headers.push(("retry-after".into(), "3".into()));
        assert_eq!(c.classify_response(&ok).backoff, None);
    }

    #[test]
    fn test_custom_retry_header_name() {
        let config = ErrorMappingConfig {
            retry_after_header: "X-RateLimit-Reset-After".into(),
            ..Default::default()
        };
        let c = ErrorClassifier::new(&config).unwrap();
        let mut resp = response(429, "{}");
        resp.headers
            .push(("x-ratelimit-reset-after".into(), "12".into()));
        assert_eq!(
            c.classify_response(&resp).backoff,
            Some(Duration::from_secs(12))
        );
    }

    #[test]
    fn test_message_mining() {
        let body: serde_json::Value =
            serde_json::from_str(r#"{"errors": {"detail": ["first", "second"]}}"#).unwrap();
        assert_eq!(
            extract_error_message(&body),
            Some("first; second".to_string())
        );

        let body: serde_json::Value = serde_json::from_str(r#"{"message":"Unauthorized"}"#).unwrap();
        assert_eq!(extract_error_message(&body), Some("Unauthorized".to_string()));

        let body: serde_json::Value = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert_eq!(extract_error_message(&body), None);
    }

    #[test]
    fn test_mined_message_on_failures() {
        let c = classifier();
        let out = c.classify_response(&response(401, r#"{"message":"Unauthorized"}"#));
        assert_eq!(out.message, "Unauthorized");

        let out = c.classify_response(&response(401, "not json"));
        assert_eq!(out.message, "HTTP 401");
    }

    #[test]
    fn test_transport_classification() {
        use crate::http::transport::TransportErrorKind;
        let c = classifier();
        let out = c.classify_transport(&TransportError::new(
            TransportErrorKind::Timeout,
            "read timed out",
        ));
        assert_eq!(out.action, ResponseAction::Retry);
        assert_eq!(out.kind, Some(FailureKind::TransientError));

        let out = c.classify_transport(&TransportError::new(
            TransportErrorKind::Other,
            "tls handshake failed",
        ));
        assert_eq!(out.action, ResponseAction::Fail);
        assert_eq!(out.kind, Some(FailureKind::SystemError));
    }
}
