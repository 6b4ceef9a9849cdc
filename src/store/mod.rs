//! Durable persistence of events, subscriptions, and deliveries.
//!
//! `Store` is the single seam all mutation goes through; the concurrency and
//! idempotency invariants in the data model only hold because nothing
//! bypasses it. Two backends implement it: [`sqlite::SqliteStore`] (the
//! single-writer local store) and [`postgres::PostgresStore`] (the
//! clustered store, atomic `SKIP LOCKED` claim, `LISTEN`/`NOTIFY`).

pub mod postgres;
pub mod sqlite;

use crate::error::Result;
use crate::types::{
    Claim, DesiredSubscription, Event, PublishInput, SubscribeInput, Subscription, SyncResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The durable persistence port. See module docs for the concurrency
/// contract; individual methods document their own invariants.
#[async_trait]
pub trait Store: Send + Sync {
    /// Writes a new pending Event. If `input.cron` is set, first checks the
    /// cron-idempotency tuple `(org_id, type, source, cron)`: if a
    /// non-terminal Event with that tuple already exists, returns it instead
    /// of inserting. The `bool` is `true` when a new row was inserted and
    /// `false` when an existing non-terminal cron Event was returned
    /// instead — callers use it to decide whether deliveries still need to
    /// be inserted for this publish.
    async fn insert_event(
        &self,
        org_id: &str,
        source: &str,
        input: PublishInput,
    ) -> Result<(Event, bool)>;

    /// Enabled subscriptions in the event's org matching its `type`, scoped
    /// further by publisher (`publisher is null` or `publisher = event.source`).
    /// Filter expressions are not evaluated.
    async fn match_subscriptions(&self, event: &Event) -> Result<Vec<Subscription>>;

    /// Bulk-inserts pending Delivery rows for `event_id`, one per
    /// `subscription_id`. No-op if `subscription_ids` is empty.
    async fn insert_deliveries(
        &self,
        event_id: Uuid,
        subscription_ids: &[Uuid],
        deliver_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Atomically claims up to `limit` eligible Deliveries (status=pending,
    /// subscription enabled, `next_retry_at` null or past), oldest first,
    /// flipping them to `processing` and returning them joined with their
    /// Event and Subscription. Two concurrent calls never return overlapping
    /// delivery ids.
    async fn claim_pending(&self, limit: i64) -> Result<Vec<Claim>>;

    /// Marks deliveries `delivered` with `delivered_at = now`.
    async fn mark_delivered(&self, delivery_ids: &[Uuid]) -> Result<()>;

    /// Applies the retry policy: increments `attempts`; terminal `failed` if
    /// `attempts >= max_attempts`, else `pending` with exponential backoff
    /// (`now + min(base_delay_ms * 2^(attempts-1), max_delay_ms)`).
    async fn mark_failed(
        &self,
        delivery_ids: &[Uuid],
        error: &str,
        max_attempts: i32,
        base_delay_ms: i64,
        max_delay_ms: i64,
    ) -> Result<()>;

    /// Schedules a retry without incrementing `attempts` (subscriber-initiated
    /// deferral via `retryAfter`).
    async fn schedule_retry_no_increment(&self, delivery_ids: &[Uuid], delay_ms: i64)
        -> Result<()>;

    /// Recomputes an Event's rolled-up status from its Deliveries. Never
    /// downgrades a terminal status.
    async fn rollup_event_status(&self, event_id: Uuid) -> Result<()>;

    /// Flips any `processing` delivery back to `pending`, preserving
    /// `attempts`/`next_retry_at`. Called once on worker startup. Returns
    /// the number of rows reset.
    async fn reset_stuck(&self) -> Result<u64>;

    /// Cancels an Event if `source = caller_connection_id` and the Event is
    /// still non-terminal; flips it and all its non-terminal Deliveries to
    /// `failed` with `lastError = "Cancelled by publisher"`. Returns whether
    /// any row changed.
    async fn cancel_event(
        &self,
        event_id: Uuid,
        org_id: &str,
        caller_connection_id: &str,
    ) -> Result<bool>;

    /// Marks as `delivered` any non-terminal Deliveries whose Subscription
    /// belongs to `(org_id, subscriber_connection_id)`, then rolls up the
    /// Event's status. Returns whether any row changed.
    async fn ack_delivery(
        &self,
        event_id: Uuid,
        org_id: &str,
        subscriber_connection_id: &str,
    ) -> Result<bool>;

    /// Idempotent per the uniqueness tuple
    /// `(org_id, connection_id, event_type, publisher, filter)`.
    async fn subscribe(&self, org_id: &str, input: SubscribeInput) -> Result<Subscription>;

    /// Deletes a subscription scoped by org. Returns whether a row was deleted.
    async fn unsubscribe(&self, id: Uuid, org_id: &str) -> Result<bool>;

    /// Reconciles a connection's current subscriptions against a desired
    /// set identified by `(event_type, publisher)`: inserts missing tuples,
    /// updates `filter` where it changed, deletes tuples absent from
    /// `desired`, and leaves everything else unchanged.
    async fn sync_subscriptions(
        &self,
        org_id: &str,
        connection_id: &str,
        desired: Vec<DesiredSubscription>,
    ) -> Result<SyncResult>;

    async fn get_event(&self, org_id: &str, id: Uuid) -> Result<Option<Event>>;

    async fn get_subscription(&self, org_id: &str, id: Uuid) -> Result<Option<Subscription>>;

    async fn list_subscriptions(
        &self,
        org_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Vec<Subscription>>;

    /// Whether this backend can back a `ServerNotify` LISTEN/NOTIFY strategy.
    /// Only `PostgresStore` does; `SqliteStore` returns `false`.
    fn supports_listen_notify(&self) -> bool {
        false
    }
}

/// Shared backoff computation: `now + min(base_delay_ms * 2^(attempts-1), max_delay_ms)`.
/// `attempts` is the post-increment attempt count (>= 1).
pub(crate) fn backoff_delay_ms(attempts: i32, base_delay_ms: i64, max_delay_ms: i64) -> i64 {
    let exp = attempts.saturating_sub(1).min(62) as u32;
    let scaled = base_delay_ms.saturating_mul(1i64 << exp);
    scaled.min(max_delay_ms)
}
