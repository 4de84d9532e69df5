//! Substream support
//!
//! A substream derives its slices from a parent stream's records. The
//! parent runs as its own engine task and publishes records through a
//! bounded channel; the child consumes them, deduplicates partitions by
//! parent primary key (the same parent can reappear across parent
//! pages) and tracks the parent's own state for the combined checkpoint.

use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::warn;

use crate::descriptor::{StreamDescriptor, SyncMode};
use crate::error::FailureKind;
use crate::extractor::lookup_path;
use crate::runtime::{Engine, Event};

/// Backpressure bound between the parent driver and the child loop
const PARENT_CHANNEL_CAPACITY: usize = 32;

/// What the parent driver publishes to the child
#[derive(Debug, Clone)]
pub enum ParentEvent {
    /// One parent record
    Record(Value),
    /// The parent's latest state checkpoint
    State(Value),
    /// The parent failed; the child cannot proceed
    Failed { kind: FailureKind, message: String },
}

/// Run the parent stream on its own task, forwarding its events into a
/// bounded channel. Dropping the receiver stops the parent run.
pub fn spawn_parent_feed(
    engine: Engine,
    descriptor: StreamDescriptor,
    input_state: Value,
    mode: SyncMode,
) -> mpsc::Receiver<ParentEvent> {
    let (tx, rx) = mpsc::channel(PARENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut events = engine.run(descriptor, input_state, mode);
        while let Some(event) = events.next().await {
            let forwarded = match event {
                Event::Record { data, .. } => ParentEvent::Record(data),
                Event::StateCheckpoint(blob) => ParentEvent::State(blob),
                Event::Failure { kind, message } => {
                    let _ = tx.send(ParentEvent::Failed { kind, message }).await;
                    return;
                }
                Event::Log { .. } => continue,
            };
            if tx.send(forwarded).await.is_err() {
                // Child went away; abandon the parent run
                return;
            }
        }
    });
    rx
}

/// Deduplicates child partitions within one run
pub struct PartitionTracker {
    parent_key: String,
    partition_field: String,
    visited: HashSet<String>,
}

impl PartitionTracker {
    /// Track partitions keyed by `parent_key`, exposed as
    /// `partition_field` in slices and state.
    pub fn new(parent_key: impl Into<String>, partition_field: impl Into<String>) -> Self {
        Self {
            parent_key: parent_key.into(),
            partition_field: partition_field.into(),
            visited: HashSet::new(),
        }
    }

    /// The partition identity for a parent record, or `None` when the
    /// record lacks the key or the partition was already processed.
    pub fn admit(&mut self, parent: &Value) -> Option<Map<String, Value>> {
        let Some(key) = lookup_path(parent, &self.parent_key) else {
            warn!(
                parent_key = %self.parent_key,
                "parent record lacks the partition key, skipping"
            );
            return None;
        };
        if !self.visited.insert(key.to_string()) {
            return None;
        }
        let mut partition = Map::new();
        partition.insert(self.partition_field.clone(), key.clone());
        Some(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tracker_dedupes_repeated_parents() {
        let mut tracker = PartitionTracker::new("id", "parent_id");

        let first = tracker.admit(&json!({"id": "cust_001"})).unwrap();
        assert_eq!(first.get("parent_id"), Some(&json!("cust_001")));

        // Same parent seen again on a later parent page
        assert!(tracker.admit(&json!({"id": "cust_001"})).is_none());
        assert!(tracker.admit(&json!({"id": "cust_002"})).is_some());
    }

    #[test]
    fn test_tracker_skips_keyless_records() {
        let mut tracker = PartitionTracker::new("id", "parent_id");
        assert!(tracker.admit(&json!({"name": "no id here"})).is_none());
    }

    #[test]
    fn test_tracker_nested_key() {
        let mut tracker = PartitionTracker::new("attributes.id", "parent_id");
        let partition = tracker
            .admit(&json!({"attributes": {"id": 42}}))
            .unwrap();
        assert_eq!(partition.get("parent_id"), Some(&json!(42)));
    }
}
