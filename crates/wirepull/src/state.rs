//! Stream state blobs
//!
//! The outer process persists state verbatim; the engine interprets it.
//! Two wire shapes exist: a flat single-cursor mapping and a
//! per-partition form used by substreams. Input is parsed into an
//! explicit sum type; a legacy flat blob read by a substream is lifted
//! into the partitioned form on read.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Cursor of one substream partition
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PartitionCursor {
    /// Identifies the partition, typically `{parent_id: ...}`
    pub partition: Map<String, Value>,
    /// The partition's cursor mapping, `{<cursor_field>: value}`
    pub cursor: Map<String, Value>,
}

/// Per-partition state shape used by substreams
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PartitionedState {
    /// Global cursor, the fallback lower bound for unseen partitions
    #[serde(default)]
    pub state: Map<String, Value>,

    /// Cursors of partitions seen so far
    #[serde(default)]
    pub states: Vec<PartitionCursor>,

    /// The parent stream's own state, keyed by parent stream name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_state: Option<Map<String, Value>>,

    /// When set, partitions are bounded by the global cursor only
    #[serde(default)]
    pub use_global_cursor: bool,

    /// Lookback window the state was written with (seconds)
    #[serde(default)]
    pub lookback_window: u64,
}

impl PartitionedState {
    /// The cursor value recorded for `partition`, falling back to the
    /// global cursor when the partition is unseen or global mode is on.
    pub fn partition_cursor(&self, partition: &Map<String, Value>, field: &str) -> Option<&Value> {
        if !self.use_global_cursor {
            if let Some(entry) = self.states.iter().find(|e| &e.partition == partition) {
                return entry.cursor.get(field);
            }
        }
        self.state.get(field)
    }

    /// Record a new cursor value for `partition`, replacing any previous
    /// entry, and advance the global cursor alongside.
    pub fn advance(&mut self, partition: Map<String, Value>, field: &str, value: Value) {
        let mut cursor = Map::new();
        cursor.insert(field.to_string(), value.clone());
        match self.states.iter_mut().find(|e| e.partition == partition) {
            Some(entry) => entry.cursor = cursor,
            None => self.states.push(PartitionCursor { partition, cursor }),
        }
        self.state.insert(field.to_string(), value);
    }
}

/// Parsed input state
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    /// No prior state
    Empty,
    /// Flat single-cursor form, `{<cursor_field>: value}`
    Global(Map<String, Value>),
    /// Per-partition substream form
    Partitioned(PartitionedState),
}

impl StreamState {
    /// Interpret a persisted state blob. The partitioned form is
    /// recognized by its reserved keys; anything else is treated as a
    /// flat cursor mapping.
    pub fn parse(blob: &Value) -> Result<Self> {
        match blob {
            Value::Null => Ok(Self::Empty),
            Value::Object(map) if map.is_empty() => Ok(Self::Empty),
            Value::Object(map) => {
                let partitioned = ["state", "states", "parent_state", "use_global_cursor"]
                    .iter()
                    .any(|k| map.contains_key(*k));
                if partitioned {
                    let parsed: PartitionedState = serde_json::from_value(blob.clone())
                        .map_err(|e| EngineError::state(format!("malformed partitioned state: {e}")))?;
                    Ok(Self::Partitioned(parsed))
                } else {
                    Ok(Self::Global(map.clone()))
                }
            }
            other => Err(EngineError::state(format!(
                "state blob must be an object, got {other}"
            ))),
        }
    }

    /// The global cursor value for `field`, whatever the shape
    pub fn cursor_value(&self, field: &str) -> Option<&Value> {
        match self {
            Self::Empty => None,
            Self::Global(map) => map.get(field),
            Self::Partitioned(state) => state.state.get(field),
        }
    }

    /// Lift into the partitioned form for substream use. A legacy flat
    /// cursor becomes the global lower bound for every partition, with
    /// no per-partition entries and no parent state.
    pub fn into_partitioned(self, lookback_window: u64) -> PartitionedState {
        match self {
            Self::Empty => PartitionedState {
                lookback_window,
                ..Default::default()
            },
            Self::Global(map) => PartitionedState {
                state: map,
                lookback_window,
                ..Default::default()
            },
            Self::Partitioned(state) => state,
        }
    }

    /// Serialize back to the wire shape
    pub fn to_value(&self) -> Value {
        match self {
            Self::Empty => Value::Object(Map::new()),
            Self::Global(map) => Value::Object(map.clone()),
            Self::Partitioned(state) => {
                // Serialization of a plain struct with Serialize derived
                serde_json::to_value(state).unwrap_or(Value::Object(Map::new()))
            }
        }
    }
}
