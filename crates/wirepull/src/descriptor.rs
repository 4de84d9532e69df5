//! Stream descriptors and connector configuration
//!
//! A [`StreamDescriptor`] is the static, declarative description of one
//! logical stream: where its endpoint lives, how pages chain together,
//! which field carries the cursor, how errors map to actions and which
//! credentials to attach. Per-connector endpoint catalogs are plain data
//! in this shape; there is no per-stream type hierarchy.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::auth::AuthConfig;
use crate::backoff::RetrySpec;
use crate::classify::ErrorMappingConfig;
use crate::cursor::CursorComparator;
use crate::paginator::PaginationConfig;
use crate::slices::SliceConfig;

/// HTTP methods supported by stream endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Map to the reqwest method type
    pub fn as_reqwest_method(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Static declaration of one stream
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct StreamDescriptor {
    /// Stream name, used in events and state
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    /// Primary key field(s); composite keys list multiple paths
    #[serde(default)]
    pub primary_key: Vec<String>,

    /// Record field whose total order drives incremental sync
    #[serde(default)]
    pub cursor_field: Option<String>,

    /// How cursor values compare
    #[serde(default)]
    pub cursor_comparator: CursorComparator,

    /// Overlap subtracted from a resume cursor to tolerate out-of-order
    /// server writes (seconds)
    #[serde(default)]
    pub lookback_window_secs: u64,

    /// Base URL of the API
    #[validate(url)]
    pub url_base: String,

    /// Path template; `{parent_id}` is interpolated for substreams
    pub path: String,

    /// HTTP method (default GET)
    #[serde(default)]
    pub method: HttpMethod,

    /// Static request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Static query parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// JSON request body template; mutually exclusive with `form_body`
    #[serde(default)]
    pub json_body: Option<serde_json::Value>,

    /// Form-encoded request body; mutually exclusive with `json_body`
    #[serde(default)]
    pub form_body: Option<BTreeMap<String, String>>,

    /// Drop query parameters whose value already appears in the URL
    #[serde(default = "default_true")]
    pub dedupe_params: bool,

    /// Path into the response body holding the record list
    /// (e.g. `list`, `records`, `items[0].children`); empty means the
    /// whole body
    #[serde(default)]
    pub record_path: String,

    /// Records requested per page; falls back to the connector default
    #[serde(default)]
    #[validate(range(min = 1, max = 10_000))]
    pub page_size: Option<u32>,

    /// Query parameter carrying the page size; omitted when unset
    #[serde(default)]
    pub page_size_param: Option<String>,

    /// Pagination rule for this stream
    #[serde(default)]
    pub pagination: PaginationConfig,

    /// Retry policy
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySpec,

    /// Error-classification overrides
    #[serde(default)]
    pub error_mapping: ErrorMappingConfig,

    /// Credentials to attach to outgoing requests
    #[serde(default)]
    pub auth: AuthConfig,

    /// Slicing strategy (time windows, quantity ranges, parent records)
    #[serde(default)]
    pub slicing: SliceConfig,

    /// Parent stream declaration for substreams
    #[serde(default)]
    pub parent: Option<Box<ParentSpec>>,

    /// Emit a state checkpoint every N records, in addition to the
    /// end-of-slice checkpoints
    #[serde(default)]
    pub checkpoint_interval: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl StreamDescriptor {
    /// Minimal descriptor for a GET endpoint; everything else defaulted
    pub fn new(name: impl Into<String>, url_base: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: Vec::new(),
            cursor_field: None,
            cursor_comparator: CursorComparator::default(),
            lookback_window_secs: 0,
            url_base: url_base.into(),
            path: path.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            json_body: None,
            form_body: None,
            dedupe_params: true,
            record_path: String::new(),
            page_size: None,
            page_size_param: None,
            pagination: PaginationConfig::default(),
            retry: RetrySpec::default(),
            error_mapping: ErrorMappingConfig::default(),
            auth: AuthConfig::default(),
            slicing: SliceConfig::default(),
            parent: None,
            checkpoint_interval: None,
        }
    }

    /// Whether this stream advances a cursor
    pub fn is_incremental(&self) -> bool {
        self.cursor_field.is_some()
    }
}

/// Parent stream binding for a substream
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ParentSpec {
    /// Descriptor of the parent stream
    pub stream: StreamDescriptor,

    /// Parent record field used as the child partition key
    #[serde(default = "default_parent_key")]
    pub parent_key: String,

    /// Name under which the partition key appears in child slices and
    /// partition state
    #[serde(default = "default_partition_field")]
    pub partition_field: String,
}

fn default_parent_key() -> String {
    "id".to_string()
}

fn default_partition_field() -> String {
    "parent_id".to_string()
}

/// Sync mode requested by the outer process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Re-read everything; input state is ignored for window lower bounds
    FullRefresh,
    /// Resume from the input state cursor
    Incremental,
}

/// Connector-level options shared by all streams of a source
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ConnectorConfig {
    /// Lower bound for the first sync (default: 2 years before now)
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,

    /// Optional upper bound (default: now)
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,

    /// Default page size for streams that do not set their own
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 10_000))]
    pub page_size: u32,

    /// User-Agent header for outgoing requests
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Parallel stream workers for the outer process; the engine itself
    /// runs one stream at a time
    #[serde(default = "default_num_workers")]
    #[validate(range(min = 1, max = 10))]
    pub num_workers: u32,
}

fn default_page_size() -> u32 {
    100
}

fn default_num_workers() -> u32 {
    10
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            page_size: default_page_size(),
            user_agent: None,
            num_workers: default_num_workers(),
        }
    }
}

impl ConnectorConfig {
    /// Effective lower bound when neither state nor `start_date` is set
    pub fn default_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.start_date.unwrap_or(now - chrono::Duration::days(730))
    }

    /// Effective upper bound for window planning
    pub fn effective_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end_date.map(|e| e.min(now)).unwrap_or(now)
    }
}
