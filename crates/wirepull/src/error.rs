//! Error types for the wirepull engine
//!
//! Every terminal error carries a [`FailureKind`] so the outer process can
//! distinguish operator mistakes (bad credentials, malformed config) from
//! server-side problems and from transient conditions that were retried
//! until exhaustion.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse classification attached to every terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad credentials or malformed configuration; the operator must act
    ConfigError,
    /// Non-recoverable server-side problem (missing mandatory resource,
    /// unexpected status, unparseable body)
    SystemError,
    /// Retryable condition that exhausted its retry budget
    TransientError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError => write!(f, "config_error"),
            Self::SystemError => write!(f, "system_error"),
            Self::TransientError => write!(f, "transient_error"),
        }
    }
}

/// Main error type for the streaming engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication setup or token refresh failed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Terminal HTTP failure after classification
    #[error("request to {url} failed with status {status}: {message}")]
    Http {
        status: u16,
        kind: FailureKind,
        message: String,
        url: String,
    },

    /// Network-level failure that is not retryable (or exhausted retries)
    #[error("transport error: {0}")]
    Transport(String),

    /// Retry budget exhausted for a transient condition
    #[error("retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted {
        attempts: u32,
        kind: FailureKind,
        message: String,
    },

    /// Response body could not be parsed or the record path is invalid
    #[error("extraction error: {0}")]
    Extract(String),

    /// State blob could not be interpreted
    #[error("state error: {0}")]
    State(String),

    /// Pagination produced an invalid next-page target
    #[error("pagination error: {0}")]
    Pagination(String),

    /// The run was cancelled
    #[error("cancelled")]
    Cancelled,

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create an extraction error
    pub fn extract(msg: impl Into<String>) -> Self {
        Self::Extract(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// The failure kind surfaced to the outer process for this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Config(_) | Self::Auth(_) => FailureKind::ConfigError,
            Self::Http { kind, .. } => *kind,
            Self::RetriesExhausted { kind, .. } => *kind,
            // A transport error only surfaces when it was not retryable
            Self::Transport(_) => FailureKind::SystemError,
            Self::Cancelled => FailureKind::TransientError,
            _ => FailureKind::SystemError,
        }
    }

    /// Whether this error represents a condition worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http {
                kind: FailureKind::TransientError,
                ..
            }
        )
    }
}
