//! Authentication strategies
//!
//! An [`Authenticator`] attaches credentials to outgoing requests. The
//! static variants (basic login, bearer token, rotating token list) never
//! touch the network; the OAuth2 refresh and app-installation variants
//! keep a cached token behind a mutex and refresh it through the same
//! transport the data requests use.
//!
//! Auth headers override user-supplied headers with the same name.

mod app_install;
mod oauth;

pub use app_install::AppInstallSession;
pub use oauth::OauthSession;

use base64::Engine as _;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::http::transport::HttpTransport;
use crate::types::SensitiveString;

/// Declarative authenticator binding for a stream
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No credentials attached
    #[default]
    None,

    /// `Authorization: Basic base64(user:password)`
    Basic {
        username: String,
        password: SensitiveString,
    },

    /// `<header>: <scheme> <token>` with a single static token
    Token {
        token: SensitiveString,
        /// Scheme prefix, e.g. `Bearer` or `token`
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default = "default_auth_header")]
        header: String,
    },

    /// Round-robin over a list of static tokens, one per request, to
    /// spread per-key rate limits
    Multitoken {
        tokens: Vec<SensitiveString>,
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default = "default_auth_header")]
        header: String,
    },

    /// OAuth2 refresh-token grant with cached access token
    Oauth2Refresh {
        client_id: String,
        client_secret: SensitiveString,
        refresh_token: SensitiveString,
        /// Endpoint receiving the refresh grant
        token_refresh_endpoint: String,
        #[serde(default)]
        scopes: Vec<String>,
        /// Refresh when the cached token expires within this window
        #[serde(default = "default_refresh_threshold")]
        refresh_threshold_secs: u64,
        /// Wall-clock budget for retrying a transiently failing refresh
        #[serde(default = "default_refresh_max_time")]
        refresh_max_time_secs: u64,
    },

    /// Short-lived signed JWT exchanged for an installation access token
    AppInstallation {
        app_id: String,
        private_key: SensitiveString,
        installation_id: String,
        /// Endpoint issuing installation tokens; `{installation_id}` is
        /// interpolated
        token_endpoint: String,
        #[serde(default)]
        algorithm: JwtAlgorithm,
        /// JWT lifetime in seconds, capped at 10 minutes
        #[serde(default = "default_jwt_lifetime")]
        jwt_lifetime_secs: u64,
    },
}

/// Signing algorithm for app-installation JWTs
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum JwtAlgorithm {
    #[default]
    Rs256,
    Hs256,
}

fn default_scheme() -> String {
    "Bearer".to_string()
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_refresh_threshold() -> u64 {
    20
}

fn default_refresh_max_time() -> u64 {
    300
}

fn default_jwt_lifetime() -> u64 {
    600
}

/// Runtime authenticator built from an [`AuthConfig`]
pub struct Authenticator {
    inner: AuthInner,
}

enum AuthInner {
    None,
    Static {
        header: String,
        value: String,
    },
    Rotating {
        header: String,
        values: Vec<String>,
        next: AtomicUsize,
    },
    Oauth(Arc<OauthSession>),
    AppInstall(Arc<AppInstallSession>),
}

impl Authenticator {
    /// Build an authenticator. Network-backed variants keep a reference
    /// to the transport for token refresh.
    pub fn new(config: &AuthConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let inner = match config {
            AuthConfig::None => AuthInner::None,
            AuthConfig::Basic { username, password } => {
                let raw = format!("{}:{}", username, password.expose_secret());
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
                AuthInner::Static {
                    header: default_auth_header(),
                    value: format!("Basic {encoded}"),
                }
            }
            AuthConfig::Token {
                token,
                scheme,
                header,
            } => AuthInner::Static {
                header: header.clone(),
                value: format!("{} {}", scheme, token.expose_secret()),
            },
            AuthConfig::Multitoken {
                tokens,
                scheme,
                header,
            } => {
                if tokens.is_empty() {
                    return Err(EngineError::config(
                        "multitoken authenticator requires at least one token",
                    ));
                }
                AuthInner::Rotating {
                    header: header.clone(),
                    values: tokens
                        .iter()
                        .map(|t| format!("{} {}", scheme, t.expose_secret()))
                        .collect(),
                    next: AtomicUsize::new(0),
                }
            }
            AuthConfig::Oauth2Refresh { .. } => {
                AuthInner::Oauth(Arc::new(OauthSession::new(config, transport)?))
            }
            AuthConfig::AppInstallation { .. } => {
                AuthInner::AppInstall(Arc::new(AppInstallSession::new(config, transport)?))
            }
        };
        Ok(Self { inner })
    }

    /// Attach credentials, overriding any same-named user header.
    ///
    /// May block on a token refresh for the OAuth2 and app-installation
    /// variants; at most one refresh is in flight per authenticator.
    pub async fn attach(&self, headers: &mut BTreeMap<String, String>) -> Result<()> {
        match &self.inner {
            AuthInner::None => {}
            AuthInner::Static { header, value } => {
                headers.insert(header.clone(), value.clone());
            }
            AuthInner::Rotating {
                header,
                values,
                next,
            } => {
                let idx = next.fetch_add(1, Ordering::Relaxed) % values.len();
                headers.insert(header.clone(), values[idx].clone());
            }
            AuthInner::Oauth(session) => {
                let token = session.access_token().await?;
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            AuthInner::AppInstall(session) => {
                let token = session.access_token().await?;
                headers.insert("Authorization".to_string(), format!("token {token}"));
            }
        }
        Ok(())
    }
}
