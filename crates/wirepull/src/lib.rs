//! Paginated HTTP streaming engine for REST data ingestion.
//!
//! The engine accepts per-stream declarations ([`StreamDescriptor`]:
//! endpoint, pagination rule, cursor field, authentication, retry
//! policy) and produces an ordered sequence of records plus periodic
//! checkpoint state, suitable for an outer process that forwards both
//! to a downstream consumer.
//!
//! One [`Engine`] owns the shared pieces (connection pool, optional
//! call budget, cancellation token); each [`Engine::run`] drives one
//! stream end to end: slices → pages → records, with retries, token
//! refresh and cursor advancement handled inside.
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use wirepull::http::{ReqwestTransport, TransportConfig};
//! use wirepull::{ConnectorConfig, Engine, StreamDescriptor, SyncMode};
//!
//! # async fn demo() -> wirepull::Result<()> {
//! let transport = Arc::new(ReqwestTransport::new(TransportConfig::default())?);
//! let engine = Engine::new(transport, ConnectorConfig::default());
//!
//! let mut customers =
//!     StreamDescriptor::new("customers", "https://api.example.com/v2", "/customers");
//! customers.record_path = "list".into();
//!
//! let mut events = engine.run(customers, serde_json::json!({}), SyncMode::FullRefresh);
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod budget;
pub mod classify;
pub mod cursor;
pub mod descriptor;
pub mod error;
pub mod extractor;
pub mod http;
pub mod paginator;
pub mod runtime;
pub mod slices;
pub mod state;
pub mod substream;
pub mod testing;
pub mod types;

pub use descriptor::{ConnectorConfig, HttpMethod, StreamDescriptor, SyncMode};
pub use error::{EngineError, FailureKind, Result};
pub use runtime::{Engine, Event};
pub use types::SensitiveString;
