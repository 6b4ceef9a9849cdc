//! Error type for the cron expression parser.

use thiserror::Error;

/// Result type alias for cron operations
pub type Result<T> = std::result::Result<T, CronError>;

/// Cron parser errors
#[derive(Debug, Error)]
pub enum CronError {
    /// Invalid cron expression
    #[error("Invalid cron expression: {0}")]
    InvalidExpression(String),
}
