//! End-to-end engine scenarios against a scripted transport

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use wirepull::classify::{ResponseAction, StatusOverride};
use wirepull::cursor::CursorComparator;
use wirepull::descriptor::ParentSpec;
use wirepull::paginator::PaginationConfig;
use wirepull::slices::{SliceConfig, TimeWindowConfig, WindowFormat};
use wirepull::testing::{response_builder, MockTransport};
use wirepull::{ConnectorConfig, Engine, Event, FailureKind, StreamDescriptor, SyncMode};

async fn collect(
    engine: &Engine,
    descriptor: StreamDescriptor,
    state: Value,
    mode: SyncMode,
) -> Vec<Event> {
    engine.run(descriptor, state, mode).collect().await
}

fn records(events: &[Event]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Record { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

fn checkpoints(events: &[Event]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::StateCheckpoint(blob) => Some(blob.clone()),
            _ => None,
        })
        .collect()
}

fn failures(events: &[Event]) -> Vec<(FailureKind, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Failure { kind, message } => Some((*kind, message.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_full_refresh_single_page() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(200, json!({"list": [{"id": "c1"}, {"id": "c2"}]}));

    let engine = Engine::new(transport.clone(), ConnectorConfig::default());
    let mut customers = StreamDescriptor::new("customers", "https://api.example.com", "/customers");
    customers.record_path = "list".into();

    let events = collect(&engine, customers, json!({}), SyncMode::FullRefresh).await;

    let records = records(&events);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], "c1");
    assert_eq!(records[1]["id"], "c2");
    assert_eq!(checkpoints(&events), vec![json!({})]);
    assert!(failures(&events).is_empty());
    assert_eq!(transport.recorded_requests().len(), 1);
}

#[tokio::test]
async fn test_two_page_offset_pagination() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(
        200,
        json!({"list": [{"id": "s1", "updated_at": 1700000000}], "next_offset": "p2"}),
    );
    transport.enqueue_json(200, json!({"list": [{"id": "s2", "updated_at": 1700000100}]}));

    let engine = Engine::new(transport.clone(), ConnectorConfig::default());
    let mut subs = StreamDescriptor::new("subscriptions", "https://api.example.com", "/subscriptions");
    subs.record_path = "list".into();
    subs.cursor_field = Some("updated_at".into());
    subs.cursor_comparator = CursorComparator::EpochSeconds;
    subs.pagination = PaginationConfig::Offset {
        next_field: "next_offset".into(),
        param: "offset".into(),
    };

    let events = collect(&engine, subs, json!({}), SyncMode::FullRefresh).await;

    let records = records(&events);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], "s1");
    assert_eq!(records[1]["id"], "s2");
    assert_eq!(checkpoints(&events), vec![json!({"updated_at": 1700000100})]);
    assert!(failures(&events).is_empty());

    // The second request carries the threaded offset token
    let requests = transport.recorded_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].url.query(), Some("offset=p2"));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_then_success() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue(
        response_builder(429, "{}")
            .header("Retry-After", "1")
            .build(),
    );
    transport.enqueue_json(200, json!({"list": [{"id": "x"}]}));

    let engine = Engine::new(transport.clone(), ConnectorConfig::default());
    let mut items = StreamDescriptor::new("items", "https://api.example.com", "/items");
    items.record_path = "list".into();

    let began = tokio::time::Instant::now();
    let events = collect(&engine, items, json!({}), SyncMode::FullRefresh).await;

    let records = records(&events);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "x");
    assert!(failures(&events).is_empty());
    // One sleep: the requested second plus the fixed safety margin
    assert_eq!(began.elapsed().as_secs(), 2);
    assert_eq!(transport.recorded_requests().len(), 2);
}

#[tokio::test]
async fn test_connector_user_agent_reaches_the_wire() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(200, json!({"list": []}));

    let config = ConnectorConfig {
        user_agent: Some("wirepull/0.3".into()),
        ..Default::default()
    };
    let engine = Engine::new(transport.clone(), config);
    let mut items = StreamDescriptor::new("items", "https://api.example.com", "/items");
    items.record_path = "list".into();

    let events = collect(&engine, items, json!({}), SyncMode::FullRefresh).await;
    assert!(failures(&events).is_empty());

    let requests = transport.recorded_requests();
    assert_eq!(requests[0].headers.get("User-Agent").unwrap(), "wirepull/0.3");
}

#[tokio::test]
async fn test_persistent_401_is_config_failure() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(401, json!({"message": "Unauthorized"}));

    let engine = Engine::new(transport.clone(), ConnectorConfig::default());
    let mut private = StreamDescriptor::new("private", "https://api.example.com", "/private");
    private.record_path = "list".into();

    let events = collect(&engine, private, json!({}), SyncMode::FullRefresh).await;

    assert!(records(&events).is_empty());
    let failures = failures(&events);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, FailureKind::ConfigError);
    assert!(failures[0].1.contains("Unauthorized"));
    assert_eq!(transport.recorded_requests().len(), 1);
}

#[tokio::test]
async fn test_substream_with_ignored_missing_child() {
    let transport = Arc::new(MockTransport::new());
    transport.route_json("cust_001/contacts", 200, json!({"list": [{"id": "k1"}]}));
    transport.route_json("cust_002/contacts", 404, json!({}));
    transport.route_json(
        "/customers",
        200,
        json!({"list": [{"id": "cust_001"}, {"id": "cust_002"}]}),
    );

    let mut customers = StreamDescriptor::new("customers", "https://api.example.com", "/customers");
    customers.record_path = "list".into();

    let mut contacts = StreamDescriptor::new(
        "contacts",
        "https://api.example.com",
        "/customers/{parent_id}/contacts",
    );
    contacts.record_path = "list".into();
    contacts.slicing = SliceConfig::Parent;
    contacts.parent = Some(Box::new(ParentSpec {
        stream: customers,
        parent_key: "id".into(),
        partition_field: "parent_id".into(),
    }));
    contacts.error_mapping.overrides = vec![StatusOverride {
        status: 404,
        action: ResponseAction::Ignore,
        kind: None,
        message: None,
    }];

    let engine = Engine::new(transport.clone(), ConnectorConfig::default());
    let events = collect(&engine, contacts, json!({}), SyncMode::FullRefresh).await;

    let records = records(&events);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "k1");
    assert!(failures(&events).is_empty());

    // One parent page plus one request per partition
    assert_eq!(transport.recorded_requests().len(), 3);
}

#[tokio::test]
async fn test_incremental_resume() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(
        200,
        json!({"list": [{"id": "o1", "updated_at": 1705312900}]}),
    );

    let config = ConnectorConfig {
        end_date: Some(Utc.timestamp_opt(1705313000, 0).single().unwrap()),
        ..Default::default()
    };
    let engine = Engine::new(transport.clone(), config);

    let mut orders = StreamDescriptor::new("orders", "https://api.example.com", "/orders");
    orders.record_path = "list".into();
    orders.cursor_field = Some("updated_at".into());
    orders.cursor_comparator = CursorComparator::EpochSeconds;
    orders.slicing = SliceConfig::TimeWindow(TimeWindowConfig {
        step_secs: 30 * 86_400,
        start_param: "start_time".into(),
        end_param: "end_time".into(),
        format: WindowFormat::EpochSeconds,
    });

    let events = collect(
        &engine,
        orders,
        json!({"updated_at": 1705312800}),
        SyncMode::Incremental,
    )
    .await;

    assert_eq!(records(&events).len(), 1);
    assert!(failures(&events).is_empty());
    let checkpoints = checkpoints(&events);
    assert_eq!(checkpoints.last(), Some(&json!({"updated_at": 1705312900})));

    // The window's lower bound is the resume cursor
    let requests = transport.recorded_requests();
    assert_eq!(requests.len(), 1);
    let query = requests[0].url.query().unwrap_or_default();
    assert!(query.contains("start_time=1705312800"), "query was {query}");
}

#[tokio::test]
async fn test_resume_discards_stale_records() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(
        200,
        json!({"list": [
            {"id": "old", "updated_at": 900},
            {"id": "new", "updated_at": 1100}
        ]}),
    );

    let engine = Engine::new(transport.clone(), ConnectorConfig::default());
    let mut events_stream =
        StreamDescriptor::new("events", "https://api.example.com", "/events");
    events_stream.record_path = "list".into();
    events_stream.cursor_field = Some("updated_at".into());
    events_stream.cursor_comparator = CursorComparator::EpochSeconds;

    let events = collect(
        &engine,
        events_stream,
        json!({"updated_at": 1000}),
        SyncMode::Incremental,
    )
    .await;

    let records = records(&events);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "new");
    assert_eq!(
        checkpoints(&events).last(),
        Some(&json!({"updated_at": 1100}))
    );
}

#[tokio::test]
async fn test_lookback_readmits_recent_records() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(
        200,
        json!({"list": [
            {"id": "recent", "updated_at": 900},
            {"id": "ancient", "updated_at": 500},
            {"id": "new", "updated_at": 1100}
        ]}),
    );

    let engine = Engine::new(transport, ConnectorConfig::default());
    let mut stream = StreamDescriptor::new("events", "https://api.example.com", "/events");
    stream.record_path = "list".into();
    stream.cursor_field = Some("updated_at".into());
    stream.cursor_comparator = CursorComparator::EpochSeconds;
    stream.lookback_window_secs = 200;

    let events = collect(
        &engine,
        stream,
        json!({"updated_at": 1000}),
        SyncMode::Incremental,
    )
    .await;

    let ids: Vec<_> = records(&events)
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["recent", "new"]);
}

#[tokio::test]
async fn test_resume_without_new_records_keeps_cursor() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(200, json!({"list": []}));

    let engine = Engine::new(transport, ConnectorConfig::default());
    let mut stream = StreamDescriptor::new("events", "https://api.example.com", "/events");
    stream.record_path = "list".into();
    stream.cursor_field = Some("updated_at".into());
    stream.cursor_comparator = CursorComparator::EpochSeconds;

    let events = collect(
        &engine,
        stream,
        json!({"updated_at": 1705312800}),
        SyncMode::Incremental,
    )
    .await;

    assert!(records(&events).is_empty());
    // The checkpoint never regresses below the resume point
    assert_eq!(
        checkpoints(&events).last(),
        Some(&json!({"updated_at": 1705312800}))
    );
}

#[tokio::test]
async fn test_substream_checkpoint_carries_partition_cursors() {
    let transport = Arc::new(MockTransport::new());
    transport.route_json(
        "cust_001/orders",
        200,
        json!({"list": [{"id": "o1", "updated_at": 100}]}),
    );
    transport.route_json(
        "cust_002/orders",
        200,
        json!({"list": [{"id": "o2", "updated_at": 250}]}),
    );
    transport.route_json(
        "/customers",
        200,
        json!({"list": [{"id": "cust_001"}, {"id": "cust_002"}]}),
    );

    let mut customers = StreamDescriptor::new("customers", "https://api.example.com", "/customers");
    customers.record_path = "list".into();

    let mut orders = StreamDescriptor::new(
        "orders",
        "https://api.example.com",
        "/customers/{parent_id}/orders",
    );
    orders.record_path = "list".into();
    orders.cursor_field = Some("updated_at".into());
    orders.cursor_comparator = CursorComparator::EpochSeconds;
    orders.slicing = SliceConfig::Parent;
    orders.parent = Some(Box::new(ParentSpec {
        stream: customers,
        parent_key: "id".into(),
        partition_field: "parent_id".into(),
    }));

    let engine = Engine::new(transport, ConnectorConfig::default());
    let events = collect(&engine, orders, json!({}), SyncMode::FullRefresh).await;

    assert_eq!(records(&events).len(), 2);
    assert!(failures(&events).is_empty());

    let final_state = checkpoints(&events).last().cloned().unwrap();
    let states = final_state["states"].as_array().unwrap();
    assert_eq!(states.len(), 2);
    assert!(states.iter().any(|s| {
        s["partition"] == json!({"parent_id": "cust_001"})
            && s["cursor"] == json!({"updated_at": 100})
    }));
    assert!(states.iter().any(|s| {
        s["partition"] == json!({"parent_id": "cust_002"})
            && s["cursor"] == json!({"updated_at": 250})
    }));
    // The global cursor trails the maximum partition cursor
    assert_eq!(final_state["state"], json!({"updated_at": 250}));
    // The parent's own state rides along
    assert_eq!(final_state["parent_state"], json!({"customers": {}}));
}

#[tokio::test]
async fn test_substream_resumes_from_legacy_flat_state() {
    let transport = Arc::new(MockTransport::new());
    transport.route_json(
        "cust_001/orders",
        200,
        json!({"list": [
            {"id": "stale", "updated_at": 50},
            {"id": "fresh", "updated_at": 300}
        ]}),
    );
    transport.route_json("/customers", 200, json!({"list": [{"id": "cust_001"}]}));

    let mut customers = StreamDescriptor::new("customers", "https://api.example.com", "/customers");
    customers.record_path = "list".into();

    let mut orders = StreamDescriptor::new(
        "orders",
        "https://api.example.com",
        "/customers/{parent_id}/orders",
    );
    orders.record_path = "list".into();
    orders.cursor_field = Some("updated_at".into());
    orders.cursor_comparator = CursorComparator::EpochSeconds;
    orders.slicing = SliceConfig::Parent;
    orders.parent = Some(Box::new(ParentSpec {
        stream: customers,
        parent_key: "id".into(),
        partition_field: "parent_id".into(),
    }));

    let engine = Engine::new(transport, ConnectorConfig::default());
    // Legacy single-cursor state bounds every partition after migration
    let events = collect(
        &engine,
        orders,
        json!({"updated_at": 100}),
        SyncMode::Incremental,
    )
    .await;

    let records = records(&events);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "fresh");
    assert!(failures(&events).is_empty());
}

#[tokio::test]
async fn test_parent_failure_propagates() {
    let transport = Arc::new(MockTransport::new());
    transport.route_json("/customers", 403, json!({"message": "Forbidden"}));

    let mut customers = StreamDescriptor::new("customers", "https://api.example.com", "/customers");
    customers.record_path = "list".into();

    let mut contacts = StreamDescriptor::new(
        "contacts",
        "https://api.example.com",
        "/customers/{parent_id}/contacts",
    );
    contacts.record_path = "list".into();
    contacts.slicing = SliceConfig::Parent;
    contacts.parent = Some(Box::new(ParentSpec {
        stream: customers,
        parent_key: "id".into(),
        partition_field: "parent_id".into(),
    }));

    let engine = Engine::new(transport, ConnectorConfig::default());
    let events = collect(&engine, contacts, json!({}), SyncMode::FullRefresh).await;

    assert!(records(&events).is_empty());
    let failures = failures(&events);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, FailureKind::ConfigError);
    assert!(failures[0].1.contains("parent stream failed"));
}

#[tokio::test]
async fn test_cancelled_run_ends_without_failure() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(200, json!({"list": [{"id": "c1"}]}));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine =
        Engine::new(transport.clone(), ConnectorConfig::default()).with_cancellation(cancel);

    let mut customers = StreamDescriptor::new("customers", "https://api.example.com", "/customers");
    customers.record_path = "list".into();

    let events = collect(&engine, customers, json!({}), SyncMode::FullRefresh).await;

    assert!(records(&events).is_empty());
    assert!(failures(&events).is_empty());
    assert!(transport.recorded_requests().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_system_failure() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue(response_builder(200, "<html>not json</html>").build());

    let engine = Engine::new(transport, ConnectorConfig::default());
    let mut items = StreamDescriptor::new("items", "https://api.example.com", "/items");
    items.record_path = "list".into();

    let events = collect(&engine, items, json!({}), SyncMode::FullRefresh).await;

    let failures = failures(&events);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, FailureKind::SystemError);
}

#[tokio::test]
async fn test_invalid_descriptor_fails_before_any_request() {
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::new(transport.clone(), ConnectorConfig::default());

    let broken = StreamDescriptor::new("broken", "not-a-url", "/x");
    let events = collect(&engine, broken, json!({}), SyncMode::FullRefresh).await;

    let failures = failures(&events);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, FailureKind::ConfigError);
    assert!(transport.recorded_requests().is_empty());
}

#[tokio::test]
async fn test_checkpoint_interval_emits_mid_slice() {
    let transport = Arc::new(MockTransport::new());
    transport.enqueue_json(
        200,
        json!({"list": [
            {"id": "a", "updated_at": 1},
            {"id": "b", "updated_at": 2},
            {"id": "c", "updated_at": 3}
        ]}),
    );

    let engine = Engine::new(transport, ConnectorConfig::default());
    let mut stream = StreamDescriptor::new("events", "https://api.example.com", "/events");
    stream.record_path = "list".into();
    stream.cursor_field = Some("updated_at".into());
    stream.cursor_comparator = CursorComparator::EpochSeconds;
    stream.checkpoint_interval = Some(2);

    let events = collect(&engine, stream, json!({}), SyncMode::FullRefresh).await;

    // One debounced checkpoint after two records, one at slice end
    assert_eq!(
        checkpoints(&events),
        vec![json!({"updated_at": 2}), json!({"updated_at": 3})]
    );
}
