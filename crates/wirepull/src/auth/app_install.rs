//! App-installation token exchange
//!
//! Generates a short-lived signed JWT from (app_id, private_key) and
//! exchanges it at the provider for an installation access token, which
//! is cached until close to expiry. The JWT is issued slightly in the
//! past to absorb clock drift between us and the provider.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use super::{AuthConfig, JwtAlgorithm};
use crate::descriptor::HttpMethod;
use crate::error::{EngineError, Result};
use crate::http::transport::{HttpTransport, PreparedRequest};

/// Issued-at is backdated by this much to absorb clock drift
const IAT_DRIFT_SECS: i64 = 30;

/// Installation tokens are refreshed this close to expiry
const REFRESH_BUFFER_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct AppJwtClaims {
    iss: String,
    iat: i64,
    exp: i64,
}

/// Wire shape of an installation-token response. Providers either send
/// an absolute `expires_at` or a relative `expires_in`.
#[derive(Debug, Deserialize)]
struct InstallTokenResponse {
    #[serde(alias = "access_token")]
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// A shared app-installation token session
pub struct AppInstallSession {
    app_id: String,
    encoding_key: EncodingKey,
    algorithm: Algorithm,
    endpoint: Url,
    jwt_lifetime: ChronoDuration,
    transport: Arc<dyn HttpTransport>,
    cache: Mutex<Option<CachedToken>>,
}

impl AppInstallSession {
    /// Build a session from an `app_installation` auth config variant
    pub fn new(config: &AuthConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let AuthConfig::AppInstallation {
            app_id,
            private_key,
            installation_id,
            token_endpoint,
            algorithm,
            jwt_lifetime_secs,
        } = config
        else {
            return Err(EngineError::config(
                "AppInstallSession requires an app_installation auth config",
            ));
        };

        if *jwt_lifetime_secs > 600 {
            return Err(EngineError::config(
                "app JWT lifetime must not exceed 10 minutes",
            ));
        }

        let (encoding_key, algorithm) = match algorithm {
            JwtAlgorithm::Hs256 => (
                EncodingKey::from_secret(private_key.expose_secret().as_bytes()),
                Algorithm::HS256,
            ),
            JwtAlgorithm::Rs256 => (
                EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes()).map_err(
                    |e| EngineError::config(format!("failed to parse RSA private key: {e}")),
                )?,
                Algorithm::RS256,
            ),
        };

        let rendered = token_endpoint.replace("{installation_id}", installation_id);
        let endpoint = Url::parse(&rendered)
            .map_err(|e| EngineError::config(format!("invalid token_endpoint: {e}")))?;

        Ok(Self {
            app_id: app_id.clone(),
            encoding_key,
            algorithm,
            endpoint,
            jwt_lifetime: ChronoDuration::seconds(*jwt_lifetime_secs as i64),
            transport,
            cache: Mutex::new(None),
        })
    }

    /// Return a valid installation token, exchanging a fresh JWT when
    /// the cached one is gone or close to expiry.
    pub async fn access_token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;

        let now = Utc::now();
        if let Some(ref cached) = *cache {
            if cached.expires_at > now + ChronoDuration::seconds(REFRESH_BUFFER_SECS) {
                return Ok(cached.token.clone());
            }
        }

        let jwt = self.sign_jwt(now)?;
        let mut request = PreparedRequest::new(HttpMethod::Post, self.endpoint.clone());
        request
            .headers
            .insert("Authorization".to_string(), format!("Bearer {jwt}"));
        request
            .headers
            .insert("Accept".to_string(), "application/json".to_string());

        let response = self
            .transport
            .execute(&request)
            .await
            .map_err(|e| EngineError::auth(format!("installation token exchange failed: {e}")))?;

        if !response.is_success() {
            return Err(EngineError::auth(format!(
                "installation token exchange rejected with status {}",
                response.status
            )));
        }

        let parsed: InstallTokenResponse = serde_json::from_str(&response.body)
            .map_err(|e| EngineError::auth(format!("malformed installation token response: {e}")))?;

        let expires_at = parsed
            .expires_at
            .or_else(|| parsed.expires_in.map(|s| now + ChronoDuration::seconds(s)))
            .unwrap_or(now + ChronoDuration::hours(1));

        let cached = CachedToken {
            token: parsed.token,
            expires_at,
        };
        debug!(expires_at = %cached.expires_at, "exchanged app JWT for installation token");
        *cache = Some(cached.clone());
        Ok(cached.token)
    }

    fn sign_jwt(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = AppJwtClaims {
            iss: self.app_id.clone(),
            iat: (now - ChronoDuration::seconds(IAT_DRIFT_SECS)).timestamp(),
            exp: (now + self.jwt_lifetime).timestamp(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| EngineError::auth(format!("failed to sign app JWT: {e}")))
    }
}
