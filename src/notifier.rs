//! The `Notifier` port: the only way the Worker reaches a subscriber.
//!
//! Not part of the core implementation — callers supply one. The core only
//! ever calls `deliver` and interprets the `BatchResult` it returns; it has
//! no opinion on transport (HTTP callback, in-process channel, message
//! broker) and ships no production implementation.

use crate::types::{BatchResult, CloudEvent};
use async_trait::async_trait;

/// Delivers a batch of CloudEvents to one subscriber connection.
///
/// `connection_id` identifies the subscriber the events are destined for;
/// `events` is ordered oldest-first within the batch. Implementations decide
/// their own batching/fan-out/timeout policy and report the outcome via
/// `BatchResult` (batch-level or per-event, see its doc comment).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, connection_id: &str, events: &[CloudEvent]) -> BatchResult;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A `Notifier` test double that records every call and replays a
    /// caller-supplied sequence of results, repeating the last one once
    /// exhausted.
    pub struct RecordingNotifier {
        pub results: Mutex<Vec<BatchResult>>,
        pub calls: AtomicUsize,
    }

    impl RecordingNotifier {
        pub fn new(results: Vec<BatchResult>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, _connection_id: &str, _events: &[CloudEvent]) -> BatchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results.first().cloned().unwrap_or_else(BatchResult::success)
            }
        }
    }
}
