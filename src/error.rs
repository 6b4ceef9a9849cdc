//! Error taxonomy for the event bus.

use thiserror::Error;

/// Errors that can cross the public API boundary.
///
/// Variants map onto the taxonomy of kinds the bus must distinguish, not onto
/// the mechanics of any one backend: `InvalidInput` and `NotFound` are caller
/// mistakes, `Conflict` is an idempotent no-op a caller may want to observe,
/// `TransientStore`/`Fatal` are backend faults, and `DeliveryFailure` never
/// crosses into publisher-facing code — it only ever drives delivery retry
/// state inside the worker.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Mutually exclusive fields, malformed cron, missing required field.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Get/cancel/ack on a missing or cross-tenant id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Not really an error: surfaced only where an idempotent no-op needs
    /// to be distinguished from a fresh row by a caller that cares.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A retryable store fault. The worker logs and waits for the next
    /// wake-up; `publish` surfaces it to the caller.
    #[error("transient store error: {0}")]
    TransientStore(#[source] sqlx::Error),

    /// Subscriber returned failure, threw, or timed out. Never surfaced to
    /// publishers; only ever observed internally while the worker drives
    /// the delivery retry state machine.
    #[error("delivery failed: {0}")]
    DeliveryFailure(String),

    /// A permanent store fault (schema mismatch, pool exhaustion past
    /// retry, corrupted row). Operator concern.
    #[error("fatal store error: {0}")]
    Fatal(#[source] sqlx::Error),

    /// Cron expression failed to parse or validate.
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] eventrelay_cron::CronError),

    /// Event payload serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A notify strategy could not be wired up: a required setting is
    /// missing (e.g. `Server` selected against a store without
    /// `LISTEN`/`NOTIFY` support) or the underlying client failed to
    /// connect. Surfaced at startup, before the bus begins delivering.
    #[error("notify strategy configuration error: {0}")]
    Configuration(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EventBusError>;

impl From<sqlx::Error> for EventBusError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                EventBusError::TransientStore(err)
            }
            sqlx::Error::RowNotFound => EventBusError::NotFound("row not found".to_string()),
            _ => EventBusError::Fatal(err),
        }
    }
}
