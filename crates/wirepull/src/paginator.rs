//! Pagination
//!
//! One declarative [`PaginationConfig`] per stream, interpreted by a
//! [`Paginator`] value with two operations: derive the next page token
//! from the previous response, and apply a token to the next request.
//! The page chain is finite and non-restartable; `None` means stop.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{EngineError, Result};
use crate::extractor::lookup_path;
use crate::http::client::RequestParts;
use crate::http::transport::HttpResponse;

/// Declarative pagination rule
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationConfig {
    /// Single page; every response is the last
    #[default]
    None,

    /// Numeric or opaque offset read from a response field
    Offset {
        /// Response field holding the next offset (dotted path)
        next_field: String,
        /// Query parameter the offset is injected as
        #[serde(default = "default_offset_param")]
        param: String,
    },

    /// Opaque cursor read from a response path
    Cursor {
        /// Response path holding the cursor (`next_cursor`, `meta.next`)
        path: String,
        /// Query parameter the cursor is injected as
        #[serde(default = "default_cursor_param")]
        param: String,
    },

    /// Full next-page URL read from the response body
    Url {
        /// Response path holding the URL (`next`, `links.next.href`)
        path: String,
    },

    /// Incrementing page number; stops when a page comes back empty
    PageNumber {
        /// Query parameter carrying the page number
        #[serde(default = "default_page_param")]
        param: String,
        /// Number of the first page
        #[serde(default = "default_first_page")]
        start: u64,
    },

    /// `Link: <...>; rel="next"` response header
    LinkHeader,
}

fn default_offset_param() -> String {
    "offset".to_string()
}

fn default_cursor_param() -> String {
    "page[after]".to_string()
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_first_page() -> u64 {
    1
}

/// Opaque token threaded from response N to request N+1
#[derive(Debug, Clone, PartialEq)]
pub enum PageToken {
    /// Offset or cursor value injected as a query parameter
    Param { name: String, value: String },
    /// Full URL to follow verbatim
    Url(Url),
    /// Next page number
    Page(u64),
}

/// Interprets a [`PaginationConfig`] for one stream run
#[derive(Debug, Clone)]
pub struct Paginator {
    config: PaginationConfig,
    base: Url,
}

impl Paginator {
    /// Build a paginator; `base` anchors same-host validation for URL
    /// variants.
    pub fn new(config: PaginationConfig, base: Url) -> Self {
        Self { config, base }
    }

    /// Inject first-page parameters into the initial request. Only the
    /// page-number variant has any.
    pub fn apply_initial(&self, parts: &mut RequestParts) {
        if let PaginationConfig::PageNumber { param, start } = &self.config {
            parts.params.push((param.clone(), start.to_string()));
        }
    }

    /// Derive the token for the next page, or `None` when the chain ends.
    ///
    /// `records_on_page` is the extracted record count of the current
    /// page; page-number pagination stops on an empty page.
    pub fn next_page_token(
        &self,
        prev: Option<&PageToken>,
        response: &HttpResponse,
        records_on_page: usize,
    ) -> Result<Option<PageToken>> {
        match &self.config {
            PaginationConfig::None => Ok(None),

            PaginationConfig::Offset { next_field, param } => {
                Ok(read_token_value(response, next_field)?.map(|value| PageToken::Param {
                    name: param.clone(),
                    value,
                }))
            }

            PaginationConfig::Cursor { path, param } => {
                Ok(read_token_value(response, path)?.map(|value| PageToken::Param {
                    name: param.clone(),
                    value,
                }))
            }

            PaginationConfig::Url { path } => match read_token_value(response, path)? {
                Some(raw) => Ok(Some(PageToken::Url(self.validate_url(&raw)?))),
                None => Ok(None),
            },

            PaginationConfig::PageNumber { start, .. } => {
                if records_on_page == 0 {
                    return Ok(None);
                }
                let next = match prev {
                    Some(PageToken::Page(n)) => n + 1,
                    _ => start + 1,
                };
                Ok(Some(PageToken::Page(next)))
            }

            PaginationConfig::LinkHeader => match response.header("link").and_then(parse_link_next)
            {
                Some(raw) => Ok(Some(PageToken::Url(self.validate_url(&raw)?))),
                None => Ok(None),
            },
        }
    }

    /// Rewrite the next request according to a token
    pub fn apply(&self, token: &PageToken, parts: &mut RequestParts) {
        match token {
            PageToken::Param { name, value } => {
                parts.params.push((name.clone(), value.clone()));
            }
            PageToken::Url(url) => {
                // The server's URL carries its own query string; ours
                // would duplicate or contradict it.
                parts.url = url.clone();
                parts.params.clear();
            }
            PageToken::Page(n) => {
                if let PaginationConfig::PageNumber { param, .. } = &self.config {
                    parts.params.push((param.clone(), n.to_string()));
                }
            }
        }
    }

    fn validate_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|e| EngineError::Pagination(format!("invalid next-page URL {raw:?}: {e}")))?;
        if url.scheme() != self.base.scheme() || url.host_str() != self.base.host_str() {
            return Err(EngineError::Pagination(format!(
                "next-page URL {url} leaves the stream's host {}",
                self.base
            )));
        }
        Ok(url)
    }
}

/// Read a pagination token value from the response body, coercing
/// numbers to strings. Null, empty string and absent all mean stop.
fn read_token_value(response: &HttpResponse, path: &str) -> Result<Option<String>> {
    let body = response.json()?;
    Ok(match lookup_path(&body, path) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Extract the `rel="next"` target from a `Link` header
fn parse_link_next(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut sections = part.split(';');
        let target = sections.next()?.trim();
        let is_next = sections.any(|attr| {
            let attr = attr.trim().to_ascii_lowercase();
            attr == "rel=\"next\"" || attr == "rel=next"
        });
        if is_next {
            return Some(
                target
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            );
        }
    }
    None
}
