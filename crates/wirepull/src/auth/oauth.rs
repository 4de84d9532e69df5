//! OAuth2 refresh-token rotation
//!
//! The session caches an access token and refreshes it through the
//! transport when it is within `refresh_threshold` of expiry. The cache
//! mutex is held across the refresh call, so under concurrent `attach`
//! calls at most one refresh is in flight; the others await the result
//! and reuse the new token. This is the only lock in the engine and it
//! never nests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use super::AuthConfig;
use crate::descriptor::HttpMethod;
use crate::error::{EngineError, Result};
use crate::http::transport::{HttpTransport, PreparedRequest, RequestBody};

/// Wire shape of a token-endpoint response
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_token_expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

struct SessionState {
    token: Option<CachedToken>,
    /// Current refresh token; providers may rotate it on every grant
    refresh_token: String,
    refresh_token_expires_at: Option<DateTime<Utc>>,
}

/// A shared OAuth2 token session
pub struct OauthSession {
    client_id: String,
    client_secret: String,
    endpoint: Url,
    scopes: Vec<String>,
    refresh_threshold: ChronoDuration,
    refresh_max_time: Duration,
    transport: Arc<dyn HttpTransport>,
    state: Mutex<SessionState>,
}

impl OauthSession {
    /// Build a session from an `oauth2_refresh` config variant
    pub fn new(config: &AuthConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let AuthConfig::Oauth2Refresh {
            client_id,
            client_secret,
            refresh_token,
            token_refresh_endpoint,
            scopes,
            refresh_threshold_secs,
            refresh_max_time_secs,
        } = config
        else {
            return Err(EngineError::config(
                "OauthSession requires an oauth2_refresh auth config",
            ));
        };

        let endpoint = Url::parse(token_refresh_endpoint).map_err(|e| {
            EngineError::config(format!("invalid token_refresh_endpoint: {e}"))
        })?;

        Ok(Self {
            client_id: client_id.clone(),
            client_secret: client_secret.expose_secret().to_string(),
            endpoint,
            scopes: scopes.clone(),
            refresh_threshold: ChronoDuration::seconds(*refresh_threshold_secs as i64),
            refresh_max_time: Duration::from_secs(*refresh_max_time_secs),
            transport,
            state: Mutex::new(SessionState {
                token: None,
                refresh_token: refresh_token.expose_secret().to_string(),
                refresh_token_expires_at: None,
            }),
        })
    }

    /// Return a valid access token, refreshing if the cached one expires
    /// within the refresh threshold.
    pub async fn access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;

        let now = Utc::now();
        if let Some(ref cached) = state.token {
            if cached.expires_at > now + self.refresh_threshold {
                return Ok(cached.access_token.clone());
            }
            debug!("access token within refresh threshold, refreshing");
        }

        if let Some(expiry) = state.refresh_token_expires_at {
            if expiry <= now {
                return Err(EngineError::auth(
                    "refresh token has expired; re-authorization required",
                ));
            }
        }

        let refreshed = self.refresh(&state.refresh_token).await?;

        let issued_at = Utc::now();
        let cached = CachedToken {
            access_token: refreshed.access_token.clone(),
            expires_at: issued_at + ChronoDuration::seconds(refreshed.expires_in),
        };
        state.token = Some(cached.clone());
        if let Some(rotated) = refreshed.refresh_token {
            state.refresh_token = rotated;
        }
        if let Some(secs) = refreshed.refresh_token_expires_in {
            state.refresh_token_expires_at = Some(issued_at + ChronoDuration::seconds(secs));
        }

        debug!(expires_at = %cached.expires_at, "refreshed OAuth2 access token");
        Ok(cached.access_token)
    }

    /// POST the refresh grant, retrying transient failures (429/5xx and
    /// network errors) with exponential backoff until `refresh_max_time`.
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        if !self.scopes.is_empty() {
            form.push(("scope".to_string(), self.scopes.join(" ")));
        }

        let start = std::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = PreparedRequest::new(HttpMethod::Post, self.endpoint.clone());
            request.body = Some(RequestBody::Form(form.clone()));

            let transient = match self.transport.execute(&request).await {
                Ok(response) if response.is_success() => {
                    return serde_json::from_str(&response.body).map_err(|e| {
                        EngineError::auth(format!("malformed token response: {e}"))
                    });
                }
                Ok(response) if response.status == 429 || response.status >= 500 => {
                    format!("token endpoint returned {}", response.status)
                }
                Ok(response) => {
                    return Err(EngineError::auth(format!(
                        "token refresh rejected with status {}: {}",
                        response.status,
                        response.body.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_transient() => e.to_string(),
                Err(e) => {
                    return Err(EngineError::auth(format!("token refresh failed: {e}")));
                }
            };

            let backoff = Duration::from_secs(2u64.saturating_pow(attempt.min(8)));
            if start.elapsed() + backoff >= self.refresh_max_time {
                return Err(EngineError::auth(format!(
                    "token refresh gave up after {attempt} attempts: {transient}"
                )));
            }
            warn!(attempt, error = %transient, "transient token refresh failure, backing off");
            tokio::time::sleep(backoff).await;
        }
    }
}
