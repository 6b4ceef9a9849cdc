//! Standard 5-field cron expression parsing and next-fire computation.
//!
//! This is the scheduling primitive `eventrelay`'s cron recurrence is built
//! on: `CronExpression::parse` validates an expression at publish time, and
//! `next_after` computes each subsequent fire time for the worker's
//! cron-reschedule step.
//!
//! ## Quick start
//!
//! ```
//! use eventrelay_cron::CronExpression;
//! use chrono::Utc;
//!
//! let expr = CronExpression::parse("*/5 * * * *").unwrap();
//! let next = expr.next_after(Utc::now());
//! assert!(next.is_some());
//! ```

mod parser;
mod types;

pub use parser::CronExpression;
pub use types::{CronError, Result};
