//! Clustered `Store` backed by Postgres: atomic claim via
//! `SELECT ... FOR UPDATE SKIP LOCKED`, cron idempotency via a partial
//! unique index, and `LISTEN`/`NOTIFY` support for `ServerNotify`.
//!
//! Grounded on the `fetch_pending`-style claim query used by Postgres-backed
//! notification/outbox stores: a subquery picks and locks candidate rows,
//! the outer `UPDATE ... RETURNING` flips and returns them in one statement
//! so two workers polling concurrently never see the same row twice.

use super::{backoff_delay_ms, Store};
use crate::error::{EventBusError, Result};
use crate::types::{
    Claim, DesiredSubscription, Event, PublishInput, Status, SubscribeInput, Subscription,
    SyncResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations/postgres").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Name of the LISTEN/NOTIFY channel used by `ServerNotify`. The core
    /// issues `NOTIFY <channel>` whenever a delivery becomes eligible.
    pub fn notify_channel(&self) -> &'static str {
        "eventrelay_delivery"
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    org_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    source: String,
    subject: Option<String>,
    time: DateTime<Utc>,
    datacontenttype: String,
    dataschema: Option<String>,
    data: Option<serde_json::Value>,
    cron: Option<String>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(r: EventRow) -> Self {
        Event {
            id: r.id,
            org_id: r.org_id,
            event_type: r.event_type,
            source: r.source,
            subject: r.subject,
            time: r.time,
            datacontenttype: r.datacontenttype,
            dataschema: r.dataschema,
            data: r.data,
            cron: r.cron,
            status: Status::from_str(&r.status),
            attempts: r.attempts,
            last_error: r.last_error,
            next_retry_at: r.next_retry_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    org_id: String,
    connection_id: String,
    event_type: String,
    publisher: Option<String>,
    filter: Option<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(r: SubscriptionRow) -> Self {
        Subscription {
            id: r.id,
            org_id: r.org_id,
            connection_id: r.connection_id,
            event_type: r.event_type,
            publisher: r.publisher,
            filter: r.filter,
            enabled: r.enabled,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: Uuid,
    event_id: Uuid,
    subscription_id: Uuid,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    delivered_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<DeliveryRow> for crate::types::Delivery {
    fn from(r: DeliveryRow) -> Self {
        crate::types::Delivery {
            id: r.id,
            event_id: r.event_id,
            subscription_id: r.subscription_id,
            status: Status::from_str(&r.status),
            attempts: r.attempts,
            last_error: r.last_error,
            delivered_at: r.delivered_at,
            next_retry_at: r.next_retry_at,
            created_at: r.created_at,
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_event(
        &self,
        org_id: &str,
        source: &str,
        input: PublishInput,
    ) -> Result<(Event, bool)> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let datacontenttype = input
            .datacontenttype
            .unwrap_or_else(|| "application/json".to_string());

        if let Some(cron) = &input.cron {
            eventrelay_cron::CronExpression::parse(cron).map_err(EventBusError::InvalidCron)?;
        }

        let row: Option<EventRow> = sqlx::query_as(
            r#"
            INSERT INTO events
                (id, org_id, type, source, subject, time, datacontenttype, dataschema, data,
                 cron, status, attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', 0, $6, $6)
            ON CONFLICT (org_id, type, source, cron)
                WHERE cron IS NOT NULL AND status IN ('pending', 'processing')
                DO NOTHING
            RETURNING id, org_id, type, source, subject, time, datacontenttype, dataschema, data,
                      cron, status, attempts, last_error, next_retry_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(org_id)
        .bind(&input.event_type)
        .bind(source)
        .bind(&input.subject)
        .bind(now)
        .bind(&datacontenttype)
        .bind(&input.dataschema)
        .bind(&input.data)
        .bind(&input.cron)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok((row.into(), true));
        }

        let existing: EventRow = sqlx::query_as(
            r#"
            SELECT id, org_id, type, source, subject, time, datacontenttype, dataschema, data,
                   cron, status, attempts, last_error, next_retry_at, created_at, updated_at
            FROM events
            WHERE org_id = $1 AND type = $2 AND source = $3 AND cron = $4
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(org_id)
        .bind(&input.event_type)
        .bind(source)
        .bind(&input.cron)
        .fetch_one(&self.pool)
        .await?;

        Ok((existing.into(), false))
    }

    async fn match_subscriptions(&self, event: &Event) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, connection_id, event_type, publisher, filter, enabled,
                   created_at, updated_at
            FROM subscriptions
            WHERE org_id = $1 AND event_type = $2 AND enabled
              AND (publisher IS NULL OR publisher = $3)
            "#,
        )
        .bind(&event.org_id)
        .bind(&event.event_type)
        .bind(&event.source)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_deliveries(
        &self,
        event_id: Uuid,
        subscription_ids: &[Uuid],
        deliver_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if subscription_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for subscription_id in subscription_ids {
            sqlx::query(
                r#"
                INSERT INTO deliveries
                    (id, event_id, subscription_id, status, attempts, next_retry_at, created_at)
                VALUES ($1, $2, $3, 'pending', 0, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(event_id)
            .bind(subscription_id)
            .bind(deliver_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_pending(&self, limit: i64) -> Result<Vec<Claim>> {
        let now = Utc::now();
        let delivery_rows: Vec<DeliveryRow> = sqlx::query_as(
            r#"
            UPDATE deliveries
            SET status = 'processing'
            WHERE id IN (
                SELECT d.id
                FROM deliveries d
                JOIN subscriptions s ON s.id = d.subscription_id
                WHERE d.status = 'pending'
                  AND s.enabled
                  AND (d.next_retry_at IS NULL OR d.next_retry_at <= $1)
                ORDER BY d.created_at
                LIMIT $2
                FOR UPDATE OF d SKIP LOCKED
            )
            RETURNING id, event_id, subscription_id, status, attempts, last_error,
                      delivered_at, next_retry_at, created_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if delivery_rows.is_empty() {
            return Ok(Vec::new());
        }

        let event_ids: Vec<Uuid> = delivery_rows.iter().map(|r| r.event_id).collect();
        let subscription_ids: Vec<Uuid> = delivery_rows.iter().map(|r| r.subscription_id).collect();

        let event_rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, type, source, subject, time, datacontenttype, dataschema, data,
                   cron, status, attempts, last_error, next_retry_at, created_at, updated_at
            FROM events WHERE id = ANY($1)
            "#,
        )
        .bind(&event_ids)
        .fetch_all(&self.pool)
        .await?;

        let subscription_rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, connection_id, event_type, publisher, filter, enabled,
                   created_at, updated_at
            FROM subscriptions WHERE id = ANY($1)
            "#,
        )
        .bind(&subscription_ids)
        .fetch_all(&self.pool)
        .await?;

        let events: HashMap<Uuid, Event> =
            event_rows.into_iter().map(|r| (r.id, r.into())).collect();
        let subscriptions: HashMap<Uuid, Subscription> = subscription_rows
            .into_iter()
            .map(|r| (r.id, r.into()))
            .collect();

        let mut claims = Vec::with_capacity(delivery_rows.len());
        for row in delivery_rows {
            let event = events
                .get(&row.event_id)
                .cloned()
                .ok_or_else(|| EventBusError::NotFound(format!("event {}", row.event_id)))?;
            let subscription = subscriptions
                .get(&row.subscription_id)
                .cloned()
                .ok_or_else(|| {
                    EventBusError::NotFound(format!("subscription {}", row.subscription_id))
                })?;
            claims.push(Claim {
                delivery: row.into(),
                event,
                subscription,
            });
        }
        Ok(claims)
    }

    async fn mark_delivered(&self, delivery_ids: &[Uuid]) -> Result<()> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        sqlx::query(
            "UPDATE deliveries SET status = 'delivered', delivered_at = $1 WHERE id = ANY($2)",
        )
        .bind(now)
        .bind(delivery_ids)
        .execute(&self.pool)
        .await?;

        let event_ids: Vec<Uuid> = sqlx::query(
            "SELECT DISTINCT event_id FROM deliveries WHERE id = ANY($1)",
        )
        .bind(delivery_ids)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get("event_id"))
        .collect();
        for event_id in event_ids {
            self.rollup_event_status(event_id).await?;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        delivery_ids: &[Uuid],
        error: &str,
        max_attempts: i32,
        base_delay_ms: i64,
        max_delay_ms: i64,
    ) -> Result<()> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let rows: Vec<(Uuid, i32, Uuid)> = sqlx::query_as(
            "SELECT id, attempts, event_id FROM deliveries WHERE id = ANY($1)",
        )
        .bind(delivery_ids)
        .fetch_all(&self.pool)
        .await?;

        for (delivery_id, attempts, event_id) in rows {
            let attempts = attempts + 1;
            if attempts >= max_attempts {
                sqlx::query(
                    "UPDATE deliveries SET status = 'failed', attempts = $1, last_error = $2, next_retry_at = NULL WHERE id = $3",
                )
                .bind(attempts)
                .bind(error)
                .bind(delivery_id)
                .execute(&self.pool)
                .await?;
            } else {
                let delay = backoff_delay_ms(attempts, base_delay_ms, max_delay_ms);
                let next_retry_at = now + chrono::Duration::milliseconds(delay);
                sqlx::query(
                    "UPDATE deliveries SET status = 'pending', attempts = $1, last_error = $2, next_retry_at = $3 WHERE id = $4",
                )
                .bind(attempts)
                .bind(error)
                .bind(next_retry_at)
                .bind(delivery_id)
                .execute(&self.pool)
                .await?;
            }
            self.rollup_event_status(event_id).await?;
        }
        Ok(())
    }

    async fn schedule_retry_no_increment(
        &self,
        delivery_ids: &[Uuid],
        delay_ms: i64,
    ) -> Result<()> {
        if delivery_ids.is_empty() {
            return Ok(());
        }
        let next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
        sqlx::query(
            "UPDATE deliveries SET status = 'pending', next_retry_at = $1 WHERE id = ANY($2)",
        )
        .bind(next_retry_at)
        .bind(delivery_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rollup_event_status(&self, event_id: Uuid) -> Result<()> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM deliveries WHERE event_id = $1 GROUP BY status",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        if counts.is_empty() {
            return Ok(());
        }

        let total: i64 = counts.iter().map(|(_, c)| c).sum();
        let delivered: i64 = counts
            .iter()
            .find(|(s, _)| s == "delivered")
            .map(|(_, c)| *c)
            .unwrap_or(0);
        let failed: i64 = counts
            .iter()
            .find(|(s, _)| s == "failed")
            .map(|(_, c)| *c)
            .unwrap_or(0);

        // A cron Event never reaches `delivered` (it keeps producing new
        // deliveries instead); it only goes terminal via `failed`/cancel.
        let cron: Option<String> =
            sqlx::query_scalar("SELECT cron FROM events WHERE id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        let new_status = if delivered == total {
            if cron.is_some() {
                return Ok(());
            }
            "delivered"
        } else if delivered + failed == total {
            "failed"
        } else {
            return Ok(());
        };

        sqlx::query(
            "UPDATE events SET status = $1, updated_at = $2 WHERE id = $3 AND status NOT IN ('delivered', 'failed')",
        )
        .bind(new_status)
        .bind(Utc::now())
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_stuck(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE deliveries SET status = 'pending' WHERE status = 'processing'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cancel_event(
        &self,
        event_id: Uuid,
        org_id: &str,
        caller_connection_id: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE events SET status = 'failed', last_error = 'Cancelled by publisher', updated_at = $1
            WHERE id = $2 AND org_id = $3 AND source = $4 AND status NOT IN ('delivered', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(event_id)
        .bind(org_id)
        .bind(caller_connection_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE deliveries SET status = 'failed', last_error = 'Cancelled by publisher' WHERE event_id = $1 AND status NOT IN ('delivered', 'failed')",
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn ack_delivery(
        &self,
        event_id: Uuid,
        org_id: &str,
        subscriber_connection_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries d
            SET status = 'delivered', delivered_at = $1
            FROM subscriptions s
            WHERE d.subscription_id = s.id
              AND d.event_id = $2
              AND s.org_id = $3
              AND s.connection_id = $4
              AND d.status NOT IN ('delivered', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(event_id)
        .bind(org_id)
        .bind(subscriber_connection_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.rollup_event_status(event_id).await?;
        Ok(true)
    }

    async fn subscribe(&self, org_id: &str, input: SubscribeInput) -> Result<Subscription> {
        let now = Utc::now();
        let existing: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at
            FROM subscriptions
            WHERE org_id = $1 AND connection_id = $2 AND event_type = $3
              AND publisher IS NOT DISTINCT FROM $4 AND filter IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(org_id)
        .bind(&input.connection_id)
        .bind(&input.event_type)
        .bind(&input.publisher)
        .bind(&input.filter)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return Ok(row.into());
        }

        let row: SubscriptionRow = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, true, $7, $7)
            RETURNING id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(&input.connection_id)
        .bind(&input.event_type)
        .bind(&input.publisher)
        .bind(&input.filter)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn unsubscribe(&self, id: Uuid, org_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sync_subscriptions(
        &self,
        org_id: &str,
        connection_id: &str,
        desired: Vec<DesiredSubscription>,
    ) -> Result<SyncResult> {
        let current = self.list_subscriptions(org_id, Some(connection_id)).await?;

        let mut created = 0u32;
        let mut updated = 0u32;
        let mut unchanged = 0u32;
        let mut kept_ids = Vec::new();

        for want in &desired {
            let existing = current
                .iter()
                .find(|s| s.event_type == want.event_type && s.publisher == want.publisher);
            match existing {
                Some(s) if s.filter == want.filter => {
                    unchanged += 1;
                    kept_ids.push(s.id);
                }
                Some(s) => {
                    sqlx::query(
                        "UPDATE subscriptions SET filter = $1, updated_at = $2 WHERE id = $3",
                    )
                    .bind(&want.filter)
                    .bind(Utc::now())
                    .bind(s.id)
                    .execute(&self.pool)
                    .await?;
                    updated += 1;
                    kept_ids.push(s.id);
                }
                None => {
                    let sub = self
                        .subscribe(
                            org_id,
                            SubscribeInput {
                                connection_id: connection_id.to_string(),
                                event_type: want.event_type.clone(),
                                publisher: want.publisher.clone(),
                                filter: want.filter.clone(),
                            },
                        )
                        .await?;
                    created += 1;
                    kept_ids.push(sub.id);
                }
            }
        }

        let mut deleted = 0u32;
        for s in &current {
            if !kept_ids.contains(&s.id) {
                self.unsubscribe(s.id, org_id).await?;
                deleted += 1;
            }
        }

        let subscriptions = self.list_subscriptions(org_id, Some(connection_id)).await?;
        Ok(SyncResult {
            created,
            updated,
            deleted,
            unchanged,
            subscriptions,
        })
    }

    async fn get_event(&self, org_id: &str, id: Uuid) -> Result<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, type, source, subject, time, datacontenttype, dataschema, data,
                   cron, status, attempts, last_error, next_retry_at, created_at, updated_at
            FROM events WHERE id = $1 AND org_id = $2
            "#,
        )
        .bind(id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_subscription(&self, org_id: &str, id: Uuid) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at FROM subscriptions WHERE id = $1 AND org_id = $2",
        )
        .bind(id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_subscriptions(
        &self,
        org_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = if let Some(connection_id) = connection_id {
            sqlx::query_as(
                "SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at FROM subscriptions WHERE org_id = $1 AND connection_id = $2",
            )
            .bind(org_id)
            .bind(connection_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at FROM subscriptions WHERE org_id = $1",
            )
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }

    fn supports_listen_notify(&self) -> bool {
        true
    }
}
