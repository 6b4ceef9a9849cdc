//! Core data model: Event, Subscription, Delivery, and the wire shapes
//! exchanged with the NotifyStrategy/Notifier ports.
//!
//! All wire-facing types use camelCase JSON serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status shared by `Event` and `Delivery`.
///
/// `Delivered`/`Failed` are terminal for a non-cron `Event`; for a cron
/// `Event`, `Failed` is the terminal cancelled state and `Delivered` is never
/// reached (cron events keep producing new deliveries instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Delivered => "delivered",
            Status::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processing" => Status::Processing,
            "delivered" => Status::Delivered,
            "failed" => Status::Failed,
            _ => Status::Pending,
        }
    }
}

/// One published message tracked for durable delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub org_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub subject: Option<String>,
    pub time: DateTime<Utc>,
    pub datacontenttype: String,
    pub dataschema: Option<String>,
    pub data: Option<serde_json::Value>,
    pub cron: Option<String>,
    pub status: Status,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Render the CloudEvents 1.0 envelope handed to subscribers via the
    /// Notifier port. `data` passes through as-is.
    pub fn to_cloud_event(&self) -> CloudEvent {
        CloudEvent {
            specversion: "1.0".to_string(),
            id: self.id,
            source: self.source.clone(),
            event_type: self.event_type.clone(),
            time: self.time,
            subject: self.subject.clone(),
            datacontenttype: self.datacontenttype.clone(),
            dataschema: self.dataschema.clone(),
            data: self.data.clone(),
        }
    }

    pub fn is_cron(&self) -> bool {
        self.cron.is_some()
    }
}

/// The on-the-wire CloudEvents 1.0 envelope handed to the Notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudEvent {
    pub specversion: String,
    pub id: Uuid,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub datacontenttype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataschema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Input to `Store::insert_event` / `Bus::publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishInput {
    #[serde(rename = "type")]
    pub event_type: String,
    pub subject: Option<String>,
    pub data: Option<serde_json::Value>,
    pub dataschema: Option<String>,
    pub datacontenttype: Option<String>,
    /// One-shot scheduled delivery. Mutually exclusive with `cron`.
    pub deliver_at: Option<DateTime<Utc>>,
    /// Recurring delivery expressed as a standard 5-field cron schedule.
    /// Mutually exclusive with `deliver_at`.
    pub cron: Option<String>,
}

/// A subscriber connection's standing interest in an event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub org_id: String,
    pub connection_id: String,
    pub event_type: String,
    pub publisher: Option<String>,
    /// Opaque filter expression on `data`. The core never evaluates it.
    pub filter: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `Store::subscribe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeInput {
    pub connection_id: String,
    pub event_type: String,
    pub publisher: Option<String>,
    pub filter: Option<String>,
}

/// A desired subscription tuple used by `syncSubscriptions`, identified by
/// `(event_type, publisher)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredSubscription {
    pub event_type: String,
    pub publisher: Option<String>,
    pub filter: Option<String>,
}

/// Result of reconciling current vs. desired subscriptions for a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub unchanged: u32,
    pub subscriptions: Vec<Subscription>,
}

/// One (event, subscription) delivery attempt with its own retry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub status: Status,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A delivery joined with its parent Event and Subscription, as returned by
/// `Store::claim_pending`.
#[derive(Debug, Clone)]
pub struct Claim {
    pub delivery: Delivery,
    pub event: Event,
    pub subscription: Subscription,
}

/// Per-event outcome inside a `BatchResult`. Omitted fields fall back to the
/// batch-level fields of the enclosing `BatchResult`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerEventResult {
    pub success: Option<bool>,
    pub error: Option<String>,
    pub retry_after: Option<i64>,
}

/// Outcome of a single `Notifier::deliver` call for one connection's batch.
///
/// If `results` is present and non-empty the Worker processes in per-event
/// mode, consulting `results[eventId]` (falling back to the batch-level
/// fields for any event missing from the map); otherwise it processes the
/// whole batch uniformly using the batch-level fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success: Option<bool>,
    pub error: Option<String>,
    pub retry_after: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub results: HashMap<Uuid, PerEventResult>,
}

impl BatchResult {
    pub fn success() -> Self {
        Self {
            success: Some(true),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn deferred(retry_after_ms: i64) -> Self {
        Self {
            retry_after: Some(retry_after_ms),
            ..Default::default()
        }
    }
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        let now = now();
        Event {
            id: Uuid::new_v4(),
            org_id: "org1".to_string(),
            event_type: "order.created".to_string(),
            source: "pub1".to_string(),
            subject: Some("order/123".to_string()),
            time: now,
            datacontenttype: "application/json".to_string(),
            dataschema: None,
            data: Some(serde_json::json!({"id": "x"})),
            cron: None,
            status: Status::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn cloud_event_camel_case_round_trip() {
        let event = sample_event();
        let ce = event.to_cloud_event();
        let json = serde_json::to_value(&ce).unwrap();
        assert_eq!(json["specversion"], "1.0");
        assert_eq!(json["type"], "order.created");
        assert!(json.get("dataschema").is_none());

        let back: CloudEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.data, event.data);
    }

    #[test]
    fn is_cron_reflects_cron_field() {
        let mut event = sample_event();
        assert!(!event.is_cron());
        event.cron = Some("*/5 * * * *".to_string());
        assert!(event.is_cron());
    }

    #[test]
    fn batch_result_constructors() {
        assert_eq!(BatchResult::success().success, Some(true));
        assert_eq!(BatchResult::failure("boom").error.as_deref(), Some("boom"));
        assert_eq!(BatchResult::deferred(5000).retry_after, Some(5000));
    }

    #[test]
    fn per_event_result_falls_back_when_absent() {
        let batch = BatchResult::failure("batch-level");
        let id = Uuid::new_v4();
        let per_event = batch.results.get(&id);
        assert!(per_event.is_none());
    }
}
