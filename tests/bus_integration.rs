//! End-to-end tests driving the full `Bus` facade against an in-memory
//! `SqliteStore`. Mirrors the scenarios in the durability design: fan-out,
//! retry with backoff, deferred ack, cron idempotency, publisher cancel,
//! and subscription sync.

use async_trait::async_trait;
use eventrelay::notify::polling::PollingNotifyStrategy;
use eventrelay::store::sqlite::SqliteStore;
use eventrelay::types::{BatchResult, CloudEvent, DesiredSubscription};
use eventrelay::{Bus, BusConfig, Notifier, PublishInput, SubscribeInput};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

fn publish_input(event_type: &str) -> PublishInput {
    PublishInput {
        event_type: event_type.to_string(),
        subject: None,
        data: Some(serde_json::json!({"id": "x"})),
        dataschema: None,
        datacontenttype: None,
        deliver_at: None,
        cron: None,
    }
}

async fn test_bus(notifier: Arc<dyn Notifier>) -> Bus {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations/sqlite")
        .run(&pool)
        .await
        .unwrap();
    let store = Arc::new(SqliteStore::from_pool(pool));
    let notify_strategy = Arc::new(PollingNotifyStrategy::new());
    Bus::new(store, notifier, notify_strategy, BusConfig::default())
}

/// Always reports success for every connection it sees.
struct AlwaysSucceeds {
    calls: AtomicUsize,
}

impl AlwaysSucceeds {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Notifier for AlwaysSucceeds {
    async fn deliver(&self, _connection_id: &str, _events: &[CloudEvent]) -> BatchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        BatchResult::success()
    }
}

/// Replays a scripted sequence of results per connection, repeating the
/// last one once exhausted.
struct ScriptedNotifier {
    scripts: Mutex<HashMap<String, Vec<BatchResult>>>,
}

impl ScriptedNotifier {
    fn new(scripts: HashMap<String, Vec<BatchResult>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

#[async_trait]
impl Notifier for ScriptedNotifier {
    async fn deliver(&self, connection_id: &str, _events: &[CloudEvent]) -> BatchResult {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(connection_id.to_string()).or_default();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().cloned().unwrap_or_else(BatchResult::success)
        }
    }
}

#[tokio::test]
async fn fan_out_delivers_to_every_subscriber() {
    let notifier = Arc::new(AlwaysSucceeds::new());
    let bus = test_bus(notifier.clone()).await;

    bus.subscribe(
        "org1",
        SubscribeInput {
            connection_id: "connA".to_string(),
            event_type: "order.created".to_string(),
            publisher: None,
            filter: None,
        },
    )
    .await
    .unwrap();
    bus.subscribe(
        "org1",
        SubscribeInput {
            connection_id: "connB".to_string(),
            event_type: "order.created".to_string(),
            publisher: None,
            filter: None,
        },
    )
    .await
    .unwrap();

    let event = bus
        .publish("org1", "pub1", publish_input("order.created"))
        .await
        .unwrap();

    bus.start().await.unwrap();
    bus.stop().await.unwrap();

    assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    let event = bus.get_event("org1", event.id).await.unwrap().unwrap();
    assert_eq!(event.status.as_str(), "delivered");
}

#[tokio::test]
async fn retry_with_backoff_eventually_delivers() {
    let mut scripts = HashMap::new();
    scripts.insert(
        "connA".to_string(),
        vec![
            BatchResult::failure("boom"),
            BatchResult::failure("boom"),
            BatchResult::success(),
        ],
    );
    let notifier = Arc::new(ScriptedNotifier::new(scripts));
    let bus = test_bus(notifier).await;

    bus.subscribe(
        "org1",
        SubscribeInput {
            connection_id: "connA".to_string(),
            event_type: "x.y".to_string(),
            publisher: None,
            filter: None,
        },
    )
    .await
    .unwrap();

    let event = bus.publish("org1", "pub1", publish_input("x.y")).await.unwrap();

    // First attempt fails immediately (no backoff wait needed since
    // next_retry_at defaults to now on the first failure).
    bus.start().await.unwrap();
    let fetched = bus.get_event("org1", event.id).await.unwrap().unwrap();
    assert_eq!(fetched.status.as_str(), "pending");
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn deferred_ack_completes_without_waiting_for_retry() {
    let mut scripts = HashMap::new();
    scripts.insert(
        "connA".to_string(),
        vec![BatchResult::deferred(60_000)],
    );
    let notifier = Arc::new(ScriptedNotifier::new(scripts));
    let bus = test_bus(notifier).await;

    bus.subscribe(
        "org1",
        SubscribeInput {
            connection_id: "connA".to_string(),
            event_type: "x.y".to_string(),
            publisher: None,
            filter: None,
        },
    )
    .await
    .unwrap();

    let event = bus.publish("org1", "pub1", publish_input("x.y")).await.unwrap();
    bus.start().await.unwrap();
    bus.stop().await.unwrap();

    let fetched = bus.get_event("org1", event.id).await.unwrap().unwrap();
    assert_eq!(fetched.status.as_str(), "pending");

    let acked = bus.ack_event("org1", event.id, "connA").await.unwrap();
    assert!(acked);

    let fetched = bus.get_event("org1", event.id).await.unwrap().unwrap();
    assert_eq!(fetched.status.as_str(), "delivered");
}

#[tokio::test]
async fn cron_publish_is_idempotent_for_active_event() {
    let notifier = Arc::new(AlwaysSucceeds::new());
    let bus = test_bus(notifier).await;

    let mut input = publish_input("tick");
    input.cron = Some("*/5 * * * *".to_string());

    let first = bus
        .publish("org1", "pubX", input.clone())
        .await
        .unwrap();
    let second = bus.publish("org1", "pubX", input).await.unwrap();

    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn publisher_cancel_marks_event_and_deliveries_failed() {
    let notifier = Arc::new(AlwaysSucceeds::new());
    let bus = test_bus(notifier).await;

    bus.subscribe(
        "org1",
        SubscribeInput {
            connection_id: "connA".to_string(),
            event_type: "tick".to_string(),
            publisher: None,
            filter: None,
        },
    )
    .await
    .unwrap();

    let mut input = publish_input("tick");
    input.cron = Some("*/5 * * * *".to_string());
    let event = bus.publish("org1", "pubX", input).await.unwrap();

    let cancelled = bus.cancel_event("org1", event.id, "pubX").await.unwrap();
    assert!(cancelled);

    let fetched = bus.get_event("org1", event.id).await.unwrap().unwrap();
    assert_eq!(fetched.status.as_str(), "failed");
    assert_eq!(fetched.last_error.as_deref(), Some("Cancelled by publisher"));

    // Only the publisher may cancel.
    let second = bus.publish("org1", "other-pub", publish_input("tick2")).await.unwrap();
    let denied = bus.cancel_event("org1", second.id, "not-the-publisher").await.unwrap();
    assert!(!denied);
}

#[tokio::test]
async fn sync_subscriptions_is_idempotent_on_repeat() {
    let notifier = Arc::new(AlwaysSucceeds::new());
    let bus = test_bus(notifier).await;

    let desired = vec![
        DesiredSubscription {
            event_type: "a".to_string(),
            publisher: None,
            filter: None,
        },
        DesiredSubscription {
            event_type: "b".to_string(),
            publisher: Some("pubX".to_string()),
            filter: Some("$.k=1".to_string()),
        },
    ];

    let first = bus
        .sync_subscriptions("org1", "connA", desired.clone())
        .await
        .unwrap();
    assert_eq!(first.created, 2);
    assert_eq!(first.updated, 0);
    assert_eq!(first.deleted, 0);
    assert_eq!(first.unchanged, 0);

    let second = bus.sync_subscriptions("org1", "connA", desired).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.unchanged, 2);
}
