//! # eventrelay
//!
//! A durable, multi-tenant event bus with at-least-once delivery, retries,
//! and cron-driven recurrence.
//!
//! `eventrelay` accepts CloudEvents-shaped messages from a publisher, fans
//! them out to interested subscribers, and guarantees at-least-once
//! delivery under retries, crashes, and concurrent workers. It supports
//! scheduled one-shot delivery and cron-driven recurring delivery, and
//! gives each subscriber a per-event acknowledgement/retry protocol.
//!
//! ## Quick start
//!
//! ```rust
//! use eventrelay::{Bus, BusConfig, Notifier, PublishInput, SubscribeInput};
//! use eventrelay::notify::polling::PollingNotifyStrategy;
//! use eventrelay::store::sqlite::SqliteStore;
//! use eventrelay::types::{BatchResult, CloudEvent};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct LoggingNotifier;
//!
//! #[async_trait]
//! impl Notifier for LoggingNotifier {
//!     async fn deliver(&self, connection_id: &str, events: &[CloudEvent]) -> BatchResult {
//!         println!("delivering {} event(s) to {connection_id}", events.len());
//!         BatchResult::success()
//!     }
//! }
//!
//! # async fn example() -> eventrelay::Result<()> {
//! let store = Arc::new(SqliteStore::connect("sqlite::memory:").await?);
//! let notify_strategy = Arc::new(PollingNotifyStrategy::new());
//! let bus = Bus::new(store, Arc::new(LoggingNotifier), notify_strategy, BusConfig::default());
//!
//! bus.subscribe("org1", SubscribeInput {
//!     connection_id: "conn1".to_string(),
//!     event_type: "order.created".to_string(),
//!     publisher: None,
//!     filter: None,
//! }).await?;
//!
//! bus.start().await?;
//! bus.publish("org1", "pub1", PublishInput {
//!     event_type: "order.created".to_string(),
//!     subject: None,
//!     data: Some(serde_json::json!({"id": "abc"})),
//!     dataschema: None,
//!     datacontenttype: None,
//!     deliver_at: None,
//!     cron: None,
//! }).await?;
//! bus.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Five components, leaves first:
//!
//! - [`store`] — durable persistence of events, subscriptions, and
//!   deliveries behind the [`store::Store`] trait. Two backends ship:
//!   [`store::sqlite::SqliteStore`] (single-writer local store) and
//!   [`store::postgres::PostgresStore`] (clustered, atomic `SKIP LOCKED`
//!   claim, `LISTEN`/`NOTIFY`).
//! - [`notify`] — pluggable wake-up mechanism behind [`notify::NotifyStrategy`]:
//!   polling, Postgres `LISTEN`/`NOTIFY`, a NATS subject, and a composite of
//!   any of them.
//! - [`worker`] — claims pending deliveries in batches, groups them per
//!   subscriber connection, invokes the [`Notifier`] port, and applies the
//!   result to the store's retry state machine. Also drives cron
//!   rescheduling.
//! - [`Bus`] — the public facade. Owns a store, a worker, and a notify
//!   strategy; exposes publish/subscribe/cancel/ack/sync/start/stop.
//! - [`Notifier`] — externally supplied delivery callback. Not part of this
//!   crate's implementation; callers supply one to actually transport
//!   events to a subscriber (HTTP callback, in-process channel, message
//!   broker — this crate has no opinion).

pub mod bus;
pub mod config;
pub mod error;
pub mod notifier;
pub mod notify;
pub mod store;
pub mod types;
pub mod worker;

pub use bus::{Bus, BusMetrics};
pub use config::{BusConfig, NotifyStrategyKind};
pub use error::{EventBusError, Result};
pub use notifier::Notifier;
pub use notify::{build_strategy as build_notify_strategy, NotifyStrategy};
pub use store::Store;
pub use types::{
    BatchResult, Claim, CloudEvent, DesiredSubscription, Delivery, Event, PerEventResult,
    PublishInput, Status, SubscribeInput, Subscription, SyncResult,
};
pub use worker::{Worker, WorkerMetrics};
