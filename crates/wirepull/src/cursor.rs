//! Cursor tracking for incremental streams
//!
//! A [`StreamCursor`] watches records flow by and keeps the maximum
//! cursor value seen under a configured comparator. Ties keep the
//! current value; only a strictly greater value advances. The cursor
//! also answers whether a server-returned record falls below the resume
//! bound (minus the lookback window) and should be discarded.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::extractor::lookup_path;

/// How two cursor values compare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CursorComparator {
    /// Epoch seconds as integers
    EpochSeconds,
    /// ISO-8601 / RFC 3339 timestamps
    Iso8601,
    /// Opaque ordinal: numbers compare numerically, strings
    /// lexicographically
    #[default]
    Ordinal,
}

impl CursorComparator {
    /// Compare two cursor values; `None` when either is uncomparable
    /// under this comparator.
    pub fn compare(&self, a: &Value, b: &Value) -> Option<Ordering> {
        match self {
            Self::EpochSeconds => Some(a.as_i64()?.cmp(&b.as_i64()?)),
            Self::Iso8601 => {
                let a = parse_timestamp(a)?;
                let b = parse_timestamp(b)?;
                Some(a.cmp(&b))
            }
            Self::Ordinal => match (a, b) {
                (Value::Number(x), Value::Number(y)) => {
                    x.as_f64()?.partial_cmp(&y.as_f64()?)
                }
                (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            },
        }
    }

    /// The resume bound lowered by the lookback window. Ordinal cursors
    /// have no time axis and pass through unchanged.
    pub fn lower_by(&self, value: &Value, lookback_secs: u64) -> Value {
        if lookback_secs == 0 {
            return value.clone();
        }
        match self {
            Self::EpochSeconds => match value.as_i64() {
                Some(secs) => Value::from(secs - lookback_secs as i64),
                None => value.clone(),
            },
            Self::Iso8601 => match parse_timestamp(value) {
                Some(ts) => {
                    Value::from((ts - ChronoDuration::seconds(lookback_secs as i64)).to_rfc3339())
                }
                None => value.clone(),
            },
            Self::Ordinal => value.clone(),
        }
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// In-memory cursor for one stream (or one substream partition)
#[derive(Debug, Clone)]
pub struct StreamCursor {
    field: String,
    comparator: CursorComparator,
    current: Option<Value>,
}

impl StreamCursor {
    /// A fresh cursor with no observed value
    pub fn new(field: impl Into<String>, comparator: CursorComparator) -> Self {
        Self {
            field: field.into(),
            comparator,
            current: None,
        }
    }

    /// Seed from input state so the final checkpoint never regresses
    /// below the resume point, even when the run yields no records.
    pub fn seed(&mut self, value: Value) {
        if self.is_newer(&value) {
            self.current = Some(value);
        }
    }

    /// Advance to the record's cursor value if strictly greater
    pub fn observe(&mut self, record: &Value) {
        if let Some(value) = lookup_path(record, &self.field) {
            if self.is_newer(value) {
                self.current = Some(value.clone());
            }
        }
    }

    /// The maximum cursor value observed so far
    pub fn value(&self) -> Option<&Value> {
        self.current.as_ref()
    }

    /// Cursor field name
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Whether a record clears the resume bound. Records with a cursor
    /// strictly below `bound - lookback` are stale and skipped;
    /// records missing the cursor field pass through.
    pub fn accepts(&self, record: &Value, bound: Option<&Value>, lookback_secs: u64) -> bool {
        let Some(bound) = bound else { return true };
        let Some(value) = lookup_path(record, &self.field) else {
            return true;
        };
        let floor = self.comparator.lower_by(bound, lookback_secs);
        match self.comparator.compare(value, &floor) {
            Some(Ordering::Less) => false,
            _ => true,
        }
    }

    fn is_newer(&self, value: &Value) -> bool {
        match &self.current {
            None => true,
            Some(current) => {
                matches!(self.comparator.compare(value, current), Some(Ordering::Greater))
            }
        }
    }
}
