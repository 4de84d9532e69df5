//! Stream runtime
//!
//! [`Engine::run`] drives one stream end to end: plan slices, walk each
//! slice's page chain, extract and filter records, advance the cursor
//! and emit checkpoints. The run is a linear sequence of
//! (slice, page, record) steps; parallelism across streams belongs to
//! the outer process, which may share one engine (and its connection
//! pool, budget and cancellation token) between workers.

use async_stream::stream;
use chrono::{Duration as ChronoDuration, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use validator::Validate;

use crate::auth::Authenticator;
use crate::backoff::RetryPolicy;
use crate::budget::ApiBudget;
use crate::classify::ErrorClassifier;
use crate::cursor::StreamCursor;
use crate::descriptor::{ConnectorConfig, StreamDescriptor, SyncMode};
use crate::error::{EngineError, FailureKind, Result};
use crate::extractor::extract_records;
use crate::http::client::{HttpClient, RequestParts, SendDisposition};
use crate::http::transport::HttpTransport;
use crate::paginator::{PageToken, Paginator};
use crate::slices::{cursor_as_timestamp, plan_slices, window_start, Slice, WindowBounds};
use crate::state::{PartitionedState, StreamState};
use crate::substream::{spawn_parent_feed, ParentEvent, PartitionTracker};

/// What a stream run emits to the outer process
#[derive(Debug, Clone)]
pub enum Event {
    /// One extracted record
    Record {
        /// Stream the record belongs to
        stream: String,
        /// The record value tree
        data: Value,
    },
    /// A resumable state blob; persist verbatim
    StateCheckpoint(Value),
    /// Operational message for the outer process's log
    Log {
        level: tracing::Level,
        message: String,
    },
    /// Terminal failure; the last emitted checkpoint is the resume point
    Failure { kind: FailureKind, message: String },
}

/// Drives stream runs over a shared transport
#[derive(Clone)]
pub struct Engine {
    transport: Arc<dyn HttpTransport>,
    config: ConnectorConfig,
    budget: Option<Arc<ApiBudget>>,
    cancel: CancellationToken,
}

impl Engine {
    /// An engine over a transport and connector-level options
    pub fn new(transport: Arc<dyn HttpTransport>, config: ConnectorConfig) -> Self {
        Self {
            transport,
            config,
            budget: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Throttle all physical sends through a shared call budget
    pub fn with_budget(mut self, budget: Arc<ApiBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that cancels every run of this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one stream, yielding records, checkpoints and at most one
    /// terminal failure.
    ///
    /// Cancellation ends the run silently: the current page is
    /// abandoned and the last emitted checkpoint remains the source of
    /// truth.
    pub fn run(
        &self,
        descriptor: StreamDescriptor,
        input_state: Value,
        mode: SyncMode,
    ) -> BoxStream<'static, Event> {
        let engine = self.clone();
        Box::pin(stream! {
            if let Err(e) = descriptor.validate() {
                yield Event::Failure {
                    kind: FailureKind::ConfigError,
                    message: format!("invalid stream descriptor: {e}"),
                };
                return;
            }

            let state = match StreamState::parse(&input_state) {
                Ok(state) => state,
                Err(e) => {
                    yield Event::Failure { kind: e.failure_kind(), message: e.to_string() };
                    return;
                }
            };

            let ctx = match engine.context(&descriptor) {
                Ok(ctx) => ctx,
                Err(e) => {
                    yield Event::Failure { kind: e.failure_kind(), message: e.to_string() };
                    return;
                }
            };

            info!(stream = %descriptor.name, mode = ?mode, "starting stream run");

            if descriptor.slicing.is_parent_driven() || descriptor.parent.is_some() {
                let parent = match descriptor.parent.clone() {
                    Some(parent) => parent,
                    None => {
                        yield Event::Failure {
                            kind: FailureKind::ConfigError,
                            message: "parent-driven slicing requires a parent stream".to_string(),
                        };
                        return;
                    }
                };

                let mut partitioned = state.into_partitioned(descriptor.lookback_window_secs);
                // Resume bounds come from the input state; the live copy
                // advances as partitions complete and must not raise the
                // bound of partitions later in the same run.
                let resume_state = partitioned.clone();
                let parent_input = partitioned
                    .parent_state
                    .as_ref()
                    .and_then(|m| m.get(&parent.stream.name))
                    .cloned()
                    .unwrap_or(Value::Object(Map::new()));

                let mut feed =
                    spawn_parent_feed(engine.clone(), parent.stream.clone(), parent_input, mode);
                let mut tracker =
                    PartitionTracker::new(parent.parent_key.clone(), parent.partition_field.clone());
                let mut last_checkpoint: Option<Value> = None;
                let mut records_total = 0u64;

                while let Some(event) = feed.recv().await {
                    match event {
                        ParentEvent::State(blob) => {
                            let mut map = Map::new();
                            map.insert(parent.stream.name.clone(), blob);
                            partitioned.parent_state = Some(map);
                        }
                        ParentEvent::Failed { kind, message } => {
                            yield Event::Failure {
                                kind,
                                message: format!("parent stream failed: {message}"),
                            };
                            return;
                        }
                        ParentEvent::Record(record) => {
                            let Some(partition) = tracker.admit(&record) else {
                                continue;
                            };

                            let bound = match (mode, &descriptor.cursor_field) {
                                (SyncMode::Incremental, Some(field)) => {
                                    resume_state.partition_cursor(&partition, field).cloned()
                                }
                                _ => None,
                            };
                            let mut cursor = descriptor.cursor_field.as_ref().map(|f| {
                                StreamCursor::new(f.clone(), descriptor.cursor_comparator)
                            });
                            if let (Some(c), Some(b)) = (cursor.as_mut(), bound.clone()) {
                                c.seed(b);
                            }

                            let slices = match engine.partition_slices(
                                &descriptor,
                                bound.as_ref(),
                                &partition,
                                &record,
                            ) {
                                Ok(slices) => slices,
                                Err(e) => {
                                    yield Event::Failure {
                                        kind: e.failure_kind(),
                                        message: e.to_string(),
                                    };
                                    return;
                                }
                            };

                            for slice in slices {
                                let mut pages = ctx.slice_records(slice);
                                while let Some(item) = pages.next().await {
                                    match item {
                                        Ok(data) => {
                                            if let Some(c) = cursor.as_ref() {
                                                if !c.accepts(
                                                    &data,
                                                    bound.as_ref(),
                                                    descriptor.lookback_window_secs,
                                                ) {
                                                    continue;
                                                }
                                            }
                                            if let Some(c) = cursor.as_mut() {
                                                c.observe(&data);
                                            }
                                            records_total += 1;
                                            yield Event::Record {
                                                stream: descriptor.name.clone(),
                                                data,
                                            };
                                        }
                                        Err(EngineError::Cancelled) => {
                                            info!(stream = %descriptor.name, "run cancelled");
                                            return;
                                        }
                                        Err(e) => {
                                            yield Event::Failure {
                                                kind: e.failure_kind(),
                                                message: e.to_string(),
                                            };
                                            return;
                                        }
                                    }
                                }
                            }

                            if let (Some(field), Some(c)) =
                                (&descriptor.cursor_field, cursor.as_ref())
                            {
                                if let Some(value) = c.value() {
                                    partitioned.advance(partition.clone(), field, value.clone());
                                }
                            }
                            let blob = partitioned_blob(&partitioned);
                            last_checkpoint = Some(blob.clone());
                            yield Event::StateCheckpoint(blob);
                        }
                    }
                }

                let blob = partitioned_blob(&partitioned);
                if last_checkpoint.as_ref() != Some(&blob) {
                    yield Event::StateCheckpoint(blob);
                }
                info!(stream = %descriptor.name, records = records_total, "stream completed");
                yield Event::Log {
                    level: tracing::Level::INFO,
                    message: format!(
                        "stream {} completed with {records_total} records",
                        descriptor.name
                    ),
                };
            } else {
                let bound = match (mode, &descriptor.cursor_field) {
                    (SyncMode::Incremental, Some(field)) => state.cursor_value(field).cloned(),
                    _ => None,
                };
                let mut cursor = descriptor
                    .cursor_field
                    .as_ref()
                    .map(|f| StreamCursor::new(f.clone(), descriptor.cursor_comparator));
                if let (Some(c), Some(b)) = (cursor.as_mut(), bound.clone()) {
                    c.seed(b);
                }

                let slices = match engine.stream_slices(&descriptor, bound.as_ref()) {
                    Ok(slices) => slices,
                    Err(e) => {
                        yield Event::Failure { kind: e.failure_kind(), message: e.to_string() };
                        return;
                    }
                };

                let mut last_checkpoint: Option<Value> = None;
                let mut records_total = 0u64;
                let mut since_checkpoint = 0u64;

                for slice in slices {
                    let mut pages = ctx.slice_records(slice);
                    while let Some(item) = pages.next().await {
                        match item {
                            Ok(data) => {
                                if let Some(c) = cursor.as_ref() {
                                    if !c.accepts(
                                        &data,
                                        bound.as_ref(),
                                        descriptor.lookback_window_secs,
                                    ) {
                                        continue;
                                    }
                                }
                                if let Some(c) = cursor.as_mut() {
                                    c.observe(&data);
                                }
                                records_total += 1;
                                since_checkpoint += 1;
                                yield Event::Record {
                                    stream: descriptor.name.clone(),
                                    data,
                                };
                                if let Some(interval) = descriptor.checkpoint_interval {
                                    if since_checkpoint >= interval {
                                        since_checkpoint = 0;
                                        // Only slice-end blobs take part in the
                                        // final duplicate suppression
                                        yield Event::StateCheckpoint(global_checkpoint(
                                            cursor.as_ref(),
                                        ));
                                    }
                                }
                            }
                            Err(EngineError::Cancelled) => {
                                info!(stream = %descriptor.name, "run cancelled");
                                return;
                            }
                            Err(e) => {
                                yield Event::Failure {
                                    kind: e.failure_kind(),
                                    message: e.to_string(),
                                };
                                return;
                            }
                        }
                    }

                    let blob = global_checkpoint(cursor.as_ref());
                    last_checkpoint = Some(blob.clone());
                    since_checkpoint = 0;
                    yield Event::StateCheckpoint(blob);
                }

                let blob = global_checkpoint(cursor.as_ref());
                if last_checkpoint.as_ref() != Some(&blob) {
                    yield Event::StateCheckpoint(blob);
                }
                info!(stream = %descriptor.name, records = records_total, "stream completed");
                yield Event::Log {
                    level: tracing::Level::INFO,
                    message: format!(
                        "stream {} completed with {records_total} records",
                        descriptor.name
                    ),
                };
            }
        })
    }

    fn context(&self, descriptor: &StreamDescriptor) -> Result<StreamContext> {
        let base_url = Url::parse(&descriptor.url_base)
            .map_err(|e| EngineError::config(format!("invalid url_base: {e}")))?;
        let authenticator = Arc::new(Authenticator::new(&descriptor.auth, self.transport.clone())?);
        let classifier = ErrorClassifier::new(&descriptor.error_mapping)?;
        let policy = RetryPolicy::new(&descriptor.retry);
        let client = Arc::new(HttpClient::new(
            self.transport.clone(),
            authenticator,
            classifier,
            policy,
            self.budget.clone(),
            self.cancel.clone(),
        ));
        Ok(StreamContext {
            client,
            descriptor: Arc::new(descriptor.clone()),
            base_url,
            page_size: descriptor.page_size.unwrap_or(self.config.page_size),
            user_agent: self.config.user_agent.clone(),
        })
    }

    /// The slice plan for one run (or one substream partition)
    fn stream_slices(
        &self,
        descriptor: &StreamDescriptor,
        bound: Option<&Value>,
    ) -> Result<Vec<Slice>> {
        let now = Utc::now();
        let resume_start = bound.and_then(cursor_as_timestamp).map(|t| {
            t - ChronoDuration::seconds(descriptor.lookback_window_secs as i64)
        });
        let bounds = WindowBounds {
            start: window_start(resume_start, self.config.start_date, now),
            end: self.config.effective_end(now),
        };
        plan_slices(&descriptor.slicing, bounds)
    }

    fn partition_slices(
        &self,
        descriptor: &StreamDescriptor,
        bound: Option<&Value>,
        partition: &Map<String, Value>,
        parent: &Value,
    ) -> Result<Vec<Slice>> {
        let mut slices = self.stream_slices(descriptor, bound)?;
        for slice in &mut slices {
            slice.partition = Some(partition.clone());
            slice.parent = Some(parent.clone());
        }
        Ok(slices)
    }
}

/// Everything one slice's page loop needs, cheap to clone into the
/// per-slice record stream.
#[derive(Clone)]
struct StreamContext {
    client: Arc<HttpClient>,
    descriptor: Arc<StreamDescriptor>,
    base_url: Url,
    page_size: u32,
    user_agent: Option<String>,
}

impl StreamContext {
    /// Walk the page chain of one slice, yielding raw records. The
    /// stream ends on exhaustion or an IGNORE'd page; errors end it
    /// after yielding once.
    fn slice_records(&self, slice: Slice) -> BoxStream<'static, Result<Value>> {
        let ctx = self.clone();
        Box::pin(stream! {
            let paginator =
                Paginator::new(ctx.descriptor.pagination.clone(), ctx.base_url.clone());
            let mut token: Option<PageToken> = None;

            loop {
                let mut parts = match ctx.request_parts(&slice) {
                    Ok(parts) => parts,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                match &token {
                    None => paginator.apply_initial(&mut parts),
                    Some(t) => paginator.apply(t, &mut parts),
                }

                debug!(url = %parts.url, "requesting page");
                let (_, disposition) = match ctx.client.send(&parts).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let response = match disposition {
                    SendDisposition::Response(response) => response,
                    SendDisposition::Ignored => return,
                };

                let records = match extract_records(&response, &ctx.descriptor.record_path) {
                    Ok(records) => records,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let count = records.len();
                for record in records {
                    yield Ok(record);
                }

                token = match paginator.next_page_token(token.as_ref(), &response, count) {
                    Ok(next) => next,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                if token.is_none() {
                    return;
                }
            }
        })
    }

    /// Resolve descriptor, slice and page size into request parts
    fn request_parts(&self, slice: &Slice) -> Result<RequestParts> {
        let mut path = self.descriptor.path.clone();
        if let Some(partition) = &slice.partition {
            for (name, value) in partition {
                path = path.replace(&format!("{{{name}}}"), &render_path_value(value));
            }
        }
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let url = Url::parse(&joined)
            .map_err(|e| EngineError::config(format!("invalid request URL {joined:?}: {e}")))?;

        let mut parts = RequestParts::get(url);
        parts.method = self.descriptor.method;
        parts.dedupe_params = self.descriptor.dedupe_params;
        parts.headers = self.descriptor.headers.clone();
        if let Some(ua) = &self.user_agent {
            // A stream-level header wins over the connector default
            parts
                .headers
                .entry("User-Agent".to_string())
                .or_insert_with(|| ua.clone());
        }
        for (name, value) in &self.descriptor.params {
            parts.params.push((name.clone(), value.clone()));
        }
        for (name, value) in &slice.params {
            parts.params.push((name.clone(), value.clone()));
        }
        if let Some(param) = &self.descriptor.page_size_param {
            parts.params.push((param.clone(), self.page_size.to_string()));
        }
        parts.json_body = self.descriptor.json_body.clone();
        parts.form_body = self
            .descriptor
            .form_body
            .as_ref()
            .map(|form| form.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        Ok(parts)
    }
}

fn render_path_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The flat single-cursor state blob
fn global_checkpoint(cursor: Option<&StreamCursor>) -> Value {
    let mut map = Map::new();
    if let Some(cursor) = cursor {
        if let Some(value) = cursor.value() {
            map.insert(cursor.field().to_string(), value.clone());
        }
    }
    Value::Object(map)
}

fn partitioned_blob(state: &PartitionedState) -> Value {
    serde_json::to_value(state).unwrap_or_else(|_| Value::Object(Map::new()))
}
