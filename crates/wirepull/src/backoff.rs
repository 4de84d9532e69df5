//! Retry and backoff policy
//!
//! Two backoff strategies compose: a user-defined backoff carried by the
//! classifier (typically parsed from `Retry-After`) sleeps exactly that
//! long plus a one-second safety margin; otherwise the default backoff is
//! an exponential series `retry_factor * 2^(attempt-1)` with no jitter.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Per-stream retry configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct RetrySpec {
    /// Maximum retries after the initial attempt; `null` means unbounded
    /// within `max_time_seconds`
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,

    /// Total wall-clock budget across retries of one logical request
    #[serde(default = "default_max_time")]
    #[validate(range(min = 1, max = 86_400))]
    pub max_time_seconds: u64,

    /// Base factor of the exponential backoff series
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,

    /// Surface non-retryable HTTP errors as failures (when false, the
    /// classifier's FAIL action downgrades to IGNORE)
    #[serde(default = "default_true")]
    pub raise_on_http_errors: bool,
}

fn default_max_retries() -> Option<u32> {
    Some(5)
}

fn default_max_time() -> u64 {
    600
}

fn default_retry_factor() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_time_seconds: default_max_time(),
            retry_factor: default_retry_factor(),
            raise_on_http_errors: default_true(),
        }
    }
}

/// Safety margin added on top of server-requested backoff
const USER_BACKOFF_MARGIN: Duration = Duration::from_secs(1);

/// Runtime view of a [`RetrySpec`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: Option<u32>,
    max_time: Duration,
    retry_factor: f64,
    raise_on_http_errors: bool,
}

impl RetryPolicy {
    /// Build a policy from its configuration
    pub fn new(spec: &RetrySpec) -> Self {
        Self {
            max_retries: spec.max_retries,
            max_time: Duration::from_secs(spec.max_time_seconds),
            retry_factor: spec.retry_factor,
            raise_on_http_errors: spec.raise_on_http_errors,
        }
    }

    /// Total wall-clock budget across retries
    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    /// Whether FAIL classifications surface as failures
    pub fn raise_on_http_errors(&self) -> bool {
        self.raise_on_http_errors
    }

    /// Sleep before retry number `attempt` (1-indexed): the server's
    /// requested backoff plus margin when present, the default series
    /// otherwise.
    pub fn backoff(&self, attempt: u32, user_backoff: Option<Duration>) -> Duration {
        match user_backoff {
            Some(requested) => requested + USER_BACKOFF_MARGIN,
            None => self.default_backoff(attempt),
        }
    }

    /// The default exponential series, `retry_factor * 2^(attempt-1)`
    pub fn default_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let seconds = self.retry_factor * 2f64.powi(exponent as i32);
        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Whether the budget allows another attempt after `attempt` failed
    /// attempts and `elapsed` wall time. Total physical attempts are
    /// `max_retries + 1`.
    pub fn allows_retry(&self, attempt: u32, elapsed: Duration) -> bool {
        if elapsed >= self.max_time {
            return false;
        }
        match self.max_retries {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}
