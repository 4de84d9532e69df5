//! Transport seam between the engine and the network
//!
//! The engine never talks to `reqwest` directly: everything goes through
//! the [`HttpTransport`] trait so tests can script responses without a
//! network (see [`crate::testing::MockTransport`]) and so token refresh
//! can reuse the same connection pool as data requests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::descriptor::HttpMethod;
use crate::error::{EngineError, Result};

/// Fully-resolved request, ready to be put on the wire
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// HTTP method
    pub method: HttpMethod,
    /// Final URL, query string included
    pub url: Url,
    /// Header map; authentication headers already applied
    pub headers: BTreeMap<String, String>,
    /// Request body, if any
    pub body: Option<RequestBody>,
}

impl PreparedRequest {
    /// Create a bodyless request
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Content type implied by the body, if any
    pub fn content_type(&self) -> Option<&'static str> {
        match self.body {
            Some(RequestBody::Json(_)) => Some("application/json; charset=utf-8"),
            Some(RequestBody::Form(_)) => Some("application/x-www-form-urlencoded"),
            None => None,
        }
    }
}

/// Request body variants
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// JSON payload, sent with `Content-Type: application/json; charset=utf-8`
    Json(serde_json::Value),
    /// URL-encoded form payload
    Form(Vec<(String, String)>),
}

/// A response as seen by the engine: status, headers and the full body.
///
/// Bodies are buffered eagerly; the pagination driver needs the parsed
/// body anyway to find the next page token.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers with lowercased names
    pub headers: Vec<(String, String)>,
    /// Raw response body
    pub body: String,
    /// The URL that produced this response
    pub url: String,
}

impl HttpResponse {
    /// Look up a header by name, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the body as JSON; malformed bodies are a system error
    pub fn json(&self) -> Result<serde_json::Value> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.body)
            .map_err(|e| EngineError::extract(format!("response body is not valid JSON: {e}")))
    }

    /// Whether the status code is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network-level failure from the transport
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// What went wrong at the socket level
    pub kind: TransportErrorKind,
    /// Human-readable description
    pub message: String,
}

/// Categories of transport failure the classifier distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connect timeout, DNS failure or refused connection
    Connect,
    /// Read timeout after the connection was established
    Timeout,
    /// Peer reset or disconnected mid-response
    Disconnect,
    /// Anything else (TLS, protocol violations, request build failures)
    Other,
}

impl TransportError {
    /// Build a transport error
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether this failure is transient by default
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Connect | TransportErrorKind::Timeout | TransportErrorKind::Disconnect
        )
    }
}

/// The single seam to the network
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform one physical request/response exchange
    async fn execute(
        &self,
        request: &PreparedRequest,
    ) -> std::result::Result<HttpResponse, TransportError>;
}

/// Connection settings for the reqwest-backed transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connect timeout (default 10 s)
    pub connect_timeout: Duration,
    /// Read timeout per request (default 60 s)
    pub read_timeout: Duration,
    /// Persistent connections kept per host (default 20)
    pub pool_max_per_host: usize,
    /// User-Agent header sent with every request
    pub user_agent: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            pool_max_per_host: 20,
            user_agent: None,
        }
    }
}

/// Production transport backed by a pooled `reqwest` client.
///
/// The pool is shared across all streams targeting the same host, so one
/// `ReqwestTransport` should be created per engine, not per stream.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport from connection settings
    pub fn new(config: TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .pool_max_idle_per_host(config.pool_max_per_host)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(ref ua) = config.user_agent {
            builder = builder.user_agent(ua.clone());
        }

        let client = builder
            .build()
            .map_err(|e| EngineError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    fn to_reqwest(&self, request: &PreparedRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.as_reqwest_method(), request.url.clone());

        if let Some(ct) = request.content_type() {
            builder = builder.header("Content-Type", ct);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match &request.body {
            Some(RequestBody::Json(value)) => builder = builder.json(value),
            Some(RequestBody::Form(pairs)) => builder = builder.form(pairs),
            None => {}
        }

        builder
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: &PreparedRequest,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let response = self
            .to_reqwest(request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_ascii_lowercase(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        let body = response.text().await.map_err(|e| {
            TransportError::new(
                TransportErrorKind::Disconnect,
                format!("failed reading response body: {e}"),
            )
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
            url,
        })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if e.is_connect() {
        TransportErrorKind::Connect
    } else if e.is_body() || e.is_decode() {
        TransportErrorKind::Disconnect
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, e.to_string())
}
