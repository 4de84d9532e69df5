//! The retrying send loop
//!
//! `HttpClient::send` prepares a request (query-parameter dedup, body
//! exclusivity, auth attach), performs physical sends through the
//! transport and consults the classifier after each one. Retries run as
//! an explicit loop: total attempts are `max_retries + 1` and wall time
//! across retries stays within `max_time_seconds`. Cancellation is
//! observed before every send and during every backoff sleep.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::auth::Authenticator;
use crate::backoff::RetryPolicy;
use crate::budget::ApiBudget;
use crate::classify::{ErrorClassifier, ResponseAction};
use crate::descriptor::HttpMethod;
use crate::error::{EngineError, FailureKind, Result};
use crate::http::transport::{
    HttpResponse, HttpTransport, PreparedRequest, RequestBody,
};

/// One logical request before preparation
#[derive(Debug, Clone)]
pub struct RequestParts {
    /// HTTP method
    pub method: HttpMethod,
    /// Endpoint URL; may already carry a query string
    pub url: Url,
    /// User-supplied headers; auth headers override same-named entries
    pub headers: BTreeMap<String, String>,
    /// Query parameters to merge into the URL
    pub params: Vec<(String, String)>,
    /// JSON body; mutually exclusive with `form_body`
    pub json_body: Option<serde_json::Value>,
    /// Form body; mutually exclusive with `json_body`
    pub form_body: Option<Vec<(String, String)>>,
    /// Drop parameters whose exact (name, value) pair is already in the
    /// URL query string
    pub dedupe_params: bool,
}

impl RequestParts {
    /// A GET request with no headers, params or body
    pub fn get(url: Url) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            headers: BTreeMap::new(),
            params: Vec::new(),
            json_body: None,
            form_body: None,
            dedupe_params: true,
        }
    }
}

/// How a logical send concluded short of a terminal error
#[derive(Debug)]
pub enum SendDisposition {
    /// A 2xx (or overridden-success) response
    Response(HttpResponse),
    /// The classifier mapped the response to IGNORE; the caller treats
    /// the page as empty and the slice advances
    Ignored,
}

/// Client composing authenticator, classifier, retry policy and budget
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
    authenticator: Arc<Authenticator>,
    classifier: ErrorClassifier,
    policy: RetryPolicy,
    budget: Option<Arc<ApiBudget>>,
    cancel: CancellationToken,
}

impl HttpClient {
    /// Assemble a client for one stream run
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        authenticator: Arc<Authenticator>,
        classifier: ErrorClassifier,
        policy: RetryPolicy,
        budget: Option<Arc<ApiBudget>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            authenticator,
            classifier,
            policy,
            budget,
            cancel,
        }
    }

    /// Send one logical request, retrying per policy.
    ///
    /// Returns the last prepared request together with the disposition so
    /// callers can log what was actually sent.
    pub async fn send(&self, parts: &RequestParts) -> Result<(PreparedRequest, SendDisposition)> {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if let Some(ref budget) = self.budget {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = budget.acquire() => {}
                }
            }

            // Prepared fresh on every attempt: rotating tokens advance and
            // a refreshed access token must be picked up.
            let mut prepared = self.prepare(parts)?;
            self.authenticator.attach(&mut prepared.headers).await?;

            let (response, classified) = match self.transport.execute(&prepared).await {
                Ok(response) => {
                    let classified = self.classifier.classify_response(&response);
                    (Some(response), classified)
                }
                Err(transport_error) => {
                    let classified = self.classifier.classify_transport(&transport_error);
                    (None, classified)
                }
            };

            match classified.action {
                ResponseAction::Success => {
                    return match response {
                        Some(response) => Ok((prepared, SendDisposition::Response(response))),
                        // The classifier never maps a transport failure
                        // to success; guard against a bad custom table.
                        None => Err(EngineError::Transport(classified.message)),
                    };
                }
                ResponseAction::Ignore => {
                    info!(
                        url = %prepared.url,
                        message = %classified.message,
                        "response ignored per error mapping, treating as empty page"
                    );
                    return Ok((prepared, SendDisposition::Ignored));
                }
                ResponseAction::Fail => {
                    if !self.policy.raise_on_http_errors() && response.is_some() {
                        warn!(
                            url = %prepared.url,
                            message = %classified.message,
                            "HTTP error suppressed (raise_on_http_errors = false)"
                        );
                        return Ok((prepared, SendDisposition::Ignored));
                    }
                    return Err(match response {
                        Some(response) => EngineError::Http {
                            status: response.status,
                            kind: classified.kind.unwrap_or(FailureKind::SystemError),
                            message: classified.message,
                            url: prepared.url.to_string(),
                        },
                        None => EngineError::Transport(classified.message),
                    });
                }
                ResponseAction::Retry => {
                    if !self.policy.allows_retry(attempt, start.elapsed()) {
                        // A transient condition that exhausted its budget
                        // escalates to a system failure unless the stream
                        // mapping assigned a different kind.
                        let kind = match classified.kind {
                            Some(FailureKind::TransientError) | None => FailureKind::SystemError,
                            Some(other) => other,
                        };
                        return Err(EngineError::RetriesExhausted {
                            attempts: attempt,
                            kind,
                            message: classified.message,
                        });
                    }

                    let sleep = self.policy.backoff(attempt, classified.backoff);
                    warn!(
                        attempt,
                        sleep_secs = sleep.as_secs_f64(),
                        message = %classified.message,
                        "retryable failure, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(sleep) => {}
                    }
                }
            }
        }
    }

    /// Resolve a [`RequestParts`] into the final wire request
    pub fn prepare(&self, parts: &RequestParts) -> Result<PreparedRequest> {
        if parts.json_body.is_some() && parts.form_body.is_some() {
            return Err(EngineError::config(
                "json_body and form_body are mutually exclusive",
            ));
        }

        let url = merge_query_params(&parts.url, &parts.params, parts.dedupe_params);

        let mut prepared = PreparedRequest::new(parts.method, url);
        prepared.headers = parts.headers.clone();
        prepared.body = match (&parts.json_body, &parts.form_body) {
            (Some(json), None) => Some(RequestBody::Json(json.clone())),
            (None, Some(form)) => Some(RequestBody::Form(form.clone())),
            _ => None,
        };
        Ok(prepared)
    }
}

/// Merge `params` into the URL query string. With `dedupe` set, pairs
/// whose string-coerced value already appears under the same name are
/// dropped; value-distinct duplicates are preserved.
fn merge_query_params(url: &Url, params: &[(String, String)], dedupe: bool) -> Url {
    if params.is_empty() {
        return url.clone();
    }

    let existing: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut merged = url.clone();
    {
        let mut query = merged.query_pairs_mut();
        for (name, value) in params {
            let duplicate = existing.iter().any(|(k, v)| k == name && v == value);
            if dedupe && duplicate {
                continue;
            }
            query.append_pair(name, value);
        }
    }
    if merged.query() == Some("") {
        merged.set_query(None);
    }
    merged
}
