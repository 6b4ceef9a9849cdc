//! Single-writer `Store` backed by SQLite.
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`, so `claim_pending`
//! instead relies on the pool being configured with a single writer
//! connection (`max_connections(1)`): the select-then-update pair inside one
//! transaction is never interleaved with another writer, which gives the
//! same atomicity `PostgresStore` gets from row locks. Ids and timestamps
//! are stored as TEXT (no native UUID/TIMESTAMPTZ types), so every row is
//! read back through an explicit `TEXT -> Uuid`/`TEXT -> DateTime<Utc>`
//! conversion.

use super::{backoff_delay_ms, Store};
use crate::error::{EventBusError, Result};
use crate::types::{
    Claim, DesiredSubscription, Event, PublishInput, Status, SubscribeInput, Subscription,
    SyncResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) a SQLite database file and runs
    /// migrations. The pool is capped at one connection: SQLite serializes
    /// writers anyway, and a single connection lets `claim_pending` treat
    /// its select-then-update pair as atomic without row locks.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| EventBusError::Fatal(sqlx::Error::Decode(Box::new(e))))
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    org_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    source: String,
    subject: Option<String>,
    time: DateTime<Utc>,
    datacontenttype: String,
    dataschema: Option<String>,
    data: Option<String>,
    cron: Option<String>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: parse_uuid(&self.id)?,
            org_id: self.org_id,
            event_type: self.event_type,
            source: self.source,
            subject: self.subject,
            time: self.time,
            datacontenttype: self.datacontenttype,
            dataschema: self.dataschema,
            data: self
                .data
                .map(|d| serde_json::from_str(&d))
                .transpose()?,
            cron: self.cron,
            status: Status::from_str(&self.status),
            attempts: self.attempts,
            last_error: self.last_error,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: String,
    org_id: String,
    connection_id: String,
    event_type: String,
    publisher: Option<String>,
    filter: Option<String>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Result<Subscription> {
        Ok(Subscription {
            id: parse_uuid(&self.id)?,
            org_id: self.org_id,
            connection_id: self.connection_id,
            event_type: self.event_type,
            publisher: self.publisher,
            filter: self.filter,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DeliveryRow {
    id: String,
    event_id: String,
    subscription_id: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    delivered_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl DeliveryRow {
    fn into_delivery(self) -> Result<crate::types::Delivery> {
        Ok(crate::types::Delivery {
            id: parse_uuid(&self.id)?,
            event_id: parse_uuid(&self.event_id)?,
            subscription_id: parse_uuid(&self.subscription_id)?,
            status: Status::from_str(&self.status),
            attempts: self.attempts,
            last_error: self.last_error,
            delivered_at: self.delivered_at,
            next_retry_at: self.next_retry_at,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
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
        let data = input
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        if let Some(cron) = &input.cron {
            eventrelay_cron::CronExpression::parse(cron).map_err(EventBusError::InvalidCron)?;
        }

        let mut tx = self.pool.begin().await?;

        if input.cron.is_some() {
            let existing: Option<EventRow> = sqlx::query_as(
                r#"
                SELECT id, org_id, type, source, subject, time, datacontenttype, dataschema, data,
                       cron, status, attempts, last_error, next_retry_at, created_at, updated_at
                FROM events
                WHERE org_id = ? AND type = ? AND source = ? AND cron = ?
                  AND status IN ('pending', 'processing')
                "#,
            )
            .bind(org_id)
            .bind(&input.event_type)
            .bind(source)
            .bind(&input.cron)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                return Ok((row.into_event()?, false));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO events
                (id, org_id, type, source, subject, time, datacontenttype, dataschema, data,
                 cron, status, attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(org_id)
        .bind(&input.event_type)
        .bind(source)
        .bind(&input.subject)
        .bind(now)
        .bind(&datacontenttype)
        .bind(&input.dataschema)
        .bind(&data)
        .bind(&input.cron)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((
            Event {
                id,
                org_id: org_id.to_string(),
                event_type: input.event_type,
                source: source.to_string(),
                subject: input.subject,
                time: now,
                datacontenttype,
                dataschema: input.dataschema,
                data: input.data,
                cron: input.cron,
                status: Status::Pending,
                attempts: 0,
                last_error: None,
                next_retry_at: None,
                created_at: now,
                updated_at: now,
            },
            true,
        ))
    }

    async fn match_subscriptions(&self, event: &Event) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, org_id, connection_id, event_type, publisher, filter, enabled,
                   created_at, updated_at
            FROM subscriptions
            WHERE org_id = ? AND event_type = ? AND enabled = 1
              AND (publisher IS NULL OR publisher = ?)
            "#,
        )
        .bind(&event.org_id)
        .bind(&event.event_type)
        .bind(&event.source)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| r.into_subscription()).collect()
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
                VALUES (?, ?, ?, 'pending', 0, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(event_id.to_string())
            .bind(subscription_id.to_string())
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
        let mut tx = self.pool.begin().await?;

        let eligible_ids: Vec<String> = sqlx::query(
            r#"
            SELECT d.id AS id
            FROM deliveries d
            JOIN subscriptions s ON s.id = d.subscription_id
            WHERE d.status = 'pending'
              AND s.enabled = 1
              AND (d.next_retry_at IS NULL OR d.next_retry_at <= ?)
            ORDER BY d.created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("id"))
        .collect();

        if eligible_ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let placeholders = eligible_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let update_sql = format!(
            "UPDATE deliveries SET status = 'processing' WHERE id IN ({placeholders})"
        );
        let mut update_query = sqlx::query(&update_sql);
        for id in &eligible_ids {
            update_query = update_query.bind(id);
        }
        update_query.execute(&mut *tx).await?;

        let select_sql = format!(
            "SELECT id, event_id, subscription_id, status, attempts, last_error, delivered_at, next_retry_at, created_at FROM deliveries WHERE id IN ({placeholders})"
        );
        let mut select_query = sqlx::query_as::<_, DeliveryRow>(&select_sql);
        for id in &eligible_ids {
            select_query = select_query.bind(id);
        }
        let delivery_rows = select_query.fetch_all(&mut *tx).await?;

        tx.commit().await?;

        let event_ids: Vec<String> = delivery_rows.iter().map(|r| r.event_id.clone()).collect();
        let subscription_ids: Vec<String> =
            delivery_rows.iter().map(|r| r.subscription_id.clone()).collect();

        let event_placeholders = event_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let events_sql = format!(
            "SELECT id, org_id, type, source, subject, time, datacontenttype, dataschema, data, cron, status, attempts, last_error, next_retry_at, created_at, updated_at FROM events WHERE id IN ({event_placeholders})"
        );
        let mut events_query = sqlx::query_as::<_, EventRow>(&events_sql);
        for id in &event_ids {
            events_query = events_query.bind(id);
        }
        let event_rows = events_query.fetch_all(&self.pool).await?;

        let subscription_placeholders =
            subscription_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let subscriptions_sql = format!(
            "SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at FROM subscriptions WHERE id IN ({subscription_placeholders})"
        );
        let mut subscriptions_query = sqlx::query_as::<_, SubscriptionRow>(&subscriptions_sql);
        for id in &subscription_ids {
            subscriptions_query = subscriptions_query.bind(id);
        }
        let subscription_rows = subscriptions_query.fetch_all(&self.pool).await?;

        let mut events: HashMap<String, Event> = HashMap::new();
        for row in event_rows {
            events.insert(row.id.clone(), row.into_event()?);
        }
        let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
        for row in subscription_rows {
            subscriptions.insert(row.id.clone(), row.into_subscription()?);
        }

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
                delivery: row.into_delivery()?,
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
        let ids: Vec<String> = delivery_ids.iter().map(Uuid::to_string).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");

        let mut tx = self.pool.begin().await?;
        let update_sql = format!(
            "UPDATE deliveries SET status = 'delivered', delivered_at = ? WHERE id IN ({placeholders})"
        );
        let mut update_query = sqlx::query(&update_sql).bind(now);
        for id in &ids {
            update_query = update_query.bind(id);
        }
        update_query.execute(&mut *tx).await?;

        let select_sql =
            format!("SELECT DISTINCT event_id FROM deliveries WHERE id IN ({placeholders})");
        let mut select_query = sqlx::query(&select_sql);
        for id in &ids {
            select_query = select_query.bind(id);
        }
        let event_ids: Vec<String> = select_query
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>("event_id"))
            .collect();
        tx.commit().await?;

        for event_id in event_ids {
            self.rollup_event_status(parse_uuid(&event_id)?).await?;
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
        for &delivery_id in delivery_ids {
            let mut tx = self.pool.begin().await?;
            let row: (i32, String) = sqlx::query_as(
                "SELECT attempts, event_id FROM deliveries WHERE id = ?",
            )
            .bind(delivery_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
            let attempts = row.0 + 1;
            let event_id = row.1;

            if attempts >= max_attempts {
                sqlx::query(
                    "UPDATE deliveries SET status = 'failed', attempts = ?, last_error = ?, next_retry_at = NULL WHERE id = ?",
                )
                .bind(attempts)
                .bind(error)
                .bind(delivery_id.to_string())
                .execute(&mut *tx)
                .await?;
            } else {
                let delay = backoff_delay_ms(attempts, base_delay_ms, max_delay_ms);
                let next_retry_at = now + chrono::Duration::milliseconds(delay);
                sqlx::query(
                    "UPDATE deliveries SET status = 'pending', attempts = ?, last_error = ?, next_retry_at = ? WHERE id = ?",
                )
                .bind(attempts)
                .bind(error)
                .bind(next_retry_at)
                .bind(delivery_id.to_string())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            self.rollup_event_status(parse_uuid(&event_id)?).await?;
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
        let ids: Vec<String> = delivery_ids.iter().map(Uuid::to_string).collect();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE deliveries SET status = 'pending', next_retry_at = ? WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(next_retry_at);
        for id in &ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn rollup_event_status(&self, event_id: Uuid) -> Result<()> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM deliveries WHERE event_id = ? GROUP BY status",
        )
        .bind(event_id.to_string())
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
            sqlx::query_scalar("SELECT cron FROM events WHERE id = ?")
                .bind(event_id.to_string())
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
            "UPDATE events SET status = ?, updated_at = ? WHERE id = ? AND status NOT IN ('delivered', 'failed')",
        )
        .bind(new_status)
        .bind(Utc::now())
        .bind(event_id.to_string())
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
            UPDATE events SET status = 'failed', last_error = 'Cancelled by publisher', updated_at = ?
            WHERE id = ? AND org_id = ? AND source = ? AND status NOT IN ('delivered', 'failed')
            "#,
        )
        .bind(Utc::now())
        .bind(event_id.to_string())
        .bind(org_id)
        .bind(caller_connection_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE deliveries SET status = 'failed', last_error = 'Cancelled by publisher' WHERE event_id = ? AND status NOT IN ('delivered', 'failed')",
        )
        .bind(event_id.to_string())
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
            UPDATE deliveries
            SET status = 'delivered', delivered_at = ?
            WHERE event_id = ?
              AND status NOT IN ('delivered', 'failed')
              AND subscription_id IN (
                  SELECT id FROM subscriptions WHERE org_id = ? AND connection_id = ?
              )
            "#,
        )
        .bind(Utc::now())
        .bind(event_id.to_string())
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
            WHERE org_id = ? AND connection_id = ? AND event_type = ?
              AND publisher IS ? AND filter IS ?
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
            return row.into_subscription();
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(org_id)
        .bind(&input.connection_id)
        .bind(&input.event_type)
        .bind(&input.publisher)
        .bind(&input.filter)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Subscription {
            id,
            org_id: org_id.to_string(),
            connection_id: input.connection_id,
            event_type: input.event_type,
            publisher: input.publisher,
            filter: input.filter,
            enabled: true,
            created_at: now,
            updated_at: now,
        })
    }

    async fn unsubscribe(&self, id: Uuid, org_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ? AND org_id = ?")
            .bind(id.to_string())
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
                    sqlx::query("UPDATE subscriptions SET filter = ?, updated_at = ? WHERE id = ?")
                        .bind(&want.filter)
                        .bind(Utc::now())
                        .bind(s.id.to_string())
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
            FROM events WHERE id = ? AND org_id = ?
            "#,
        )
        .bind(id.to_string())
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_event()).transpose()
    }

    async fn get_subscription(&self, org_id: &str, id: Uuid) -> Result<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at FROM subscriptions WHERE id = ? AND org_id = ?",
        )
        .bind(id.to_string())
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.into_subscription()).transpose()
    }

    async fn list_subscriptions(
        &self,
        org_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = if let Some(connection_id) = connection_id {
            sqlx::query_as(
                "SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at FROM subscriptions WHERE org_id = ? AND connection_id = ?",
            )
            .bind(org_id)
            .bind(connection_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT id, org_id, connection_id, event_type, publisher, filter, enabled, created_at, updated_at FROM subscriptions WHERE org_id = ?",
            )
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?
        };
        rows.into_iter().map(|r| r.into_subscription()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublishInput;

    async fn test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations/sqlite").run(&pool).await.unwrap();
        SqliteStore::from_pool(pool)
    }

    fn publish_input(event_type: &str) -> PublishInput {
        PublishInput {
            event_type: event_type.to_string(),
            subject: None,
            data: Some(serde_json::json!({"k": "v"})),
            dataschema: None,
            datacontenttype: None,
            deliver_at: None,
            cron: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_event_round_trips() {
        let store = test_store().await;
        let (event, _) = store
            .insert_event("org1", "pub1", publish_input("order.created"))
            .await
            .unwrap();
        let fetched = store.get_event("org1", event.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, event.id);
        assert_eq!(fetched.event_type, "order.created");
        assert_eq!(fetched.status.as_str(), "pending");
    }

    #[tokio::test]
    async fn cron_idempotency_returns_existing_non_terminal_event() {
        let store = test_store().await;
        let mut input = publish_input("tick");
        input.cron = Some("*/5 * * * *".to_string());
        let (first, first_new) = store
            .insert_event("org1", "scheduler", input.clone())
            .await
            .unwrap();
        let (second, second_new) = store.insert_event("org1", "scheduler", input).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first_new);
        assert!(!second_new);
    }

    #[tokio::test]
    async fn claim_pending_is_exclusive_across_calls() {
        let store = test_store().await;
        let (event, _) = store
            .insert_event("org1", "pub1", publish_input("order.created"))
            .await
            .unwrap();
        let subscription = store
            .subscribe(
                "org1",
                SubscribeInput {
                    connection_id: "sub1".to_string(),
                    event_type: "order.created".to_string(),
                    publisher: None,
                    filter: None,
                },
            )
            .await
            .unwrap();
        store
            .insert_deliveries(event.id, &[subscription.id], None)
            .await
            .unwrap();

        let first_claim = store.claim_pending(10).await.unwrap();
        assert_eq!(first_claim.len(), 1);
        let second_claim = store.claim_pending(10).await.unwrap();
        assert!(second_claim.is_empty());
    }

    #[tokio::test]
    async fn events_survive_reopening_a_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("eventrelay.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let event_id = {
            let store = SqliteStore::connect(&url).await.unwrap();
            let (event, _) = store
                .insert_event("org1", "pub1", publish_input("order.created"))
                .await
                .unwrap();
            event.id
        };

        let reopened = SqliteStore::connect(&url).await.unwrap();
        let fetched = reopened.get_event("org1", event_id).await.unwrap().unwrap();
        assert_eq!(fetched.event_type, "order.created");
    }

    #[tokio::test]
    async fn mark_failed_schedules_backoff_until_max_attempts() {
        let store = test_store().await;
        let (event, _) = store
            .insert_event("org1", "pub1", publish_input("order.created"))
            .await
            .unwrap();
        let subscription = store
            .subscribe(
                "org1",
                SubscribeInput {
                    connection_id: "sub1".to_string(),
                    event_type: "order.created".to_string(),
                    publisher: None,
                    filter: None,
                },
            )
            .await
            .unwrap();
        store
            .insert_deliveries(event.id, &[subscription.id], None)
            .await
            .unwrap();
        let claim = store.claim_pending(10).await.unwrap();
        let delivery_id = claim[0].delivery.id;

        store
            .mark_failed(&[delivery_id], "boom", 1, 1000, 60_000)
            .await
            .unwrap();

        let event = store.get_event("org1", event.id).await.unwrap().unwrap();
        assert_eq!(event.status.as_str(), "failed");
    }

    #[tokio::test]
    async fn rollup_never_promotes_a_cron_event_to_delivered() {
        let store = test_store().await;
        let mut input = publish_input("tick");
        input.cron = Some("*/5 * * * *".to_string());
        let (event, _) = store.insert_event("org1", "scheduler", input).await.unwrap();
        let subscription = store
            .subscribe(
                "org1",
                SubscribeInput {
                    connection_id: "sub1".to_string(),
                    event_type: "tick".to_string(),
                    publisher: None,
                    filter: None,
                },
            )
            .await
            .unwrap();
        store
            .insert_deliveries(event.id, &[subscription.id], None)
            .await
            .unwrap();
        let claim = store.claim_pending(10).await.unwrap();
        store.mark_delivered(&[claim[0].delivery.id]).await.unwrap();
        store.rollup_event_status(event.id).await.unwrap();

        let after_tick = store.get_event("org1", event.id).await.unwrap().unwrap();
        assert_ne!(after_tick.status.as_str(), "delivered");

        // Still cancellable and still the idempotent target of a re-publish,
        // because it never went terminal on the first successful tick.
        let mut resubmit = publish_input("tick");
        resubmit.cron = Some("*/5 * * * *".to_string());
        let (again, again_new) = store
            .insert_event("org1", "scheduler", resubmit)
            .await
            .unwrap();
        assert_eq!(again.id, event.id);
        assert!(!again_new);

        assert!(store
            .cancel_event(event.id, "org1", "scheduler")
            .await
            .unwrap());
        let cancelled = store.get_event("org1", event.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status.as_str(), "failed");
    }

    #[tokio::test]
    async fn sync_subscriptions_reconciles_desired_set() {
        let store = test_store().await;
        let first_sync = store
            .sync_subscriptions(
                "org1",
                "conn1",
                vec![DesiredSubscription {
                    event_type: "order.created".to_string(),
                    publisher: None,
                    filter: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(first_sync.created, 1);

        let second_sync = store
            .sync_subscriptions(
                "org1",
                "conn1",
                vec![DesiredSubscription {
                    event_type: "order.shipped".to_string(),
                    publisher: None,
                    filter: None,
                }],
            )
            .await
            .unwrap();
        assert_eq!(second_sync.created, 1);
        assert_eq!(second_sync.deleted, 1);
        assert_eq!(second_sync.subscriptions.len(), 1);
    }
}
