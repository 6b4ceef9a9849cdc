//! The delivery loop: claims eligible deliveries, fans them out to
//! subscribers via the `Notifier` port, and applies their `BatchResult` to
//! the Store's retry state machine.
//!
//! The wake loop is grounded on the same `tokio::select!` shape as the
//! teacher's delivery processor: race a push-notify wake against a
//! poll-interval timer, so a Worker never waits longer than its configured
//! interval even if every push notification is missed.

use crate::config::BusConfig;
use crate::error::Result;
use crate::notifier::Notifier;
use crate::notify::NotifyStrategy;
use crate::store::Store;
use crate::types::{BatchResult, Claim, Event, Status};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Point-in-time counters for one Worker instance. Reset on process
/// restart; not persisted.
#[derive(Debug, Default, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub claimed_total: u64,
    pub delivered_total: u64,
    pub failed_total: u64,
    pub deferred_total: u64,
}

#[derive(Default)]
struct MetricsInner {
    claimed_total: AtomicU64,
    delivered_total: AtomicU64,
    failed_total: AtomicU64,
    deferred_total: AtomicU64,
}

impl MetricsInner {
    fn snapshot(&self) -> WorkerMetrics {
        WorkerMetrics {
            claimed_total: self.claimed_total.load(Ordering::Relaxed),
            delivered_total: self.delivered_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            deferred_total: self.deferred_total.load(Ordering::Relaxed),
        }
    }
}

pub struct Worker {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    notify_strategy: Arc<dyn NotifyStrategy>,
    config: BusConfig,
    running: Arc<RwLock<bool>>,
    processing: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<MetricsInner>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        notify_strategy: Arc<dyn NotifyStrategy>,
        config: BusConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            notify_strategy,
            config,
            running: Arc::new(RwLock::new(false)),
            processing: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            metrics: Arc::new(MetricsInner::default()),
        }
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics.snapshot()
    }

    /// Resets `processing` deliveries left over from a crashed prior
    /// instance, then starts the wake loop. Enforces single-flight per
    /// instance: calling `start` while already running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        self.store.reset_stuck().await?;

        let wake = Arc::new(Notify::new());
        self.notify_strategy.start(wake.clone()).await?;

        let worker = Arc::clone(self);
        let poll_interval = self.config.poll_interval();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                if !*running.read().await {
                    break;
                }
                if let Err(err) = worker.process_now().await {
                    tracing::warn!(error = %err, "worker batch failed");
                }
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        *self.running.write().await = false;
        self.notify_strategy.stop().await?;
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    /// Claims one batch and drives it to completion. Exposed directly so
    /// callers (and tests) can run a single pass without the wake loop.
    ///
    /// No-op if the worker isn't running, or if another `process_now` call
    /// on this instance is already in flight (single-flight per instance,
    /// enforced with a `processing` guard rather than a lock so concurrent
    /// callers never block on each other).
    pub async fn process_now(&self) -> Result<()> {
        if !*self.running.read().await {
            return Ok(());
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.process_now_inner().await;
        self.processing.store(false, Ordering::SeqCst);
        result
    }

    async fn process_now_inner(&self) -> Result<()> {
        let claims = self.store.claim_pending(self.config.batch_size).await?;
        if claims.is_empty() {
            return Ok(());
        }
        self.metrics
            .claimed_total
            .fetch_add(claims.len() as u64, Ordering::Relaxed);

        let mut unique_events: HashMap<Uuid, Event> = HashMap::new();
        let mut by_connection: HashMap<String, Vec<Claim>> = HashMap::new();
        for claim in claims {
            unique_events
                .entry(claim.event.id)
                .or_insert_with(|| claim.event.clone());
            by_connection
                .entry(claim.subscription.connection_id.clone())
                .or_default()
                .push(claim);
        }

        let futures = by_connection
            .into_values()
            .map(|claims| self.deliver_connection_batch(claims));
        join_all(futures).await;

        for event in unique_events.values() {
            if let Err(err) = self.store.rollup_event_status(event.id).await {
                tracing::warn!(error = %err, event_id = %event.id, "failed to roll up event status");
            }
            if event.is_cron() {
                self.schedule_next_cron_deliveries(event).await;
            }
        }
        Ok(())
    }

    /// Recomputes the cron's next fire time and inserts deliveries for it
    /// against the event's *current* subscriptions, unconditionally once
    /// this batch ran — even if some deliveries in it were retried rather
    /// than delivered. A no-op if the schedule is exhausted, no
    /// subscriptions remain, or the event was cancelled since being
    /// claimed.
    async fn schedule_next_cron_deliveries(&self, event: &Event) {
        let Some(cron) = &event.cron else { return };
        let Ok(expr) = eventrelay_cron::CronExpression::parse(cron) else {
            return;
        };
        let Some(next) = expr.next_after(crate::types::now()) else {
            return;
        };

        match self.store.get_event(&event.org_id, event.id).await {
            Ok(Some(current)) if matches!(current.status, Status::Failed) => return,
            Ok(Some(_)) => {}
            _ => return,
        }

        let subscriptions = match self.store.match_subscriptions(event).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, event_id = %event.id, "failed to match subscriptions for cron reschedule");
                return;
            }
        };
        if subscriptions.is_empty() {
            return;
        }
        let subscription_ids: Vec<Uuid> = subscriptions.iter().map(|s| s.id).collect();
        if let Err(err) = self
            .store
            .insert_deliveries(event.id, &subscription_ids, Some(next))
            .await
        {
            tracing::warn!(error = %err, event_id = %event.id, "failed to schedule next cron deliveries");
        }
    }

    async fn deliver_connection_batch(&self, claims: Vec<Claim>) {
        let connection_id = claims[0].subscription.connection_id.clone();
        let mut seen = HashSet::new();
        let events: Vec<_> = claims
            .iter()
            .filter(|c| seen.insert(c.event.id))
            .map(|c| c.event.to_cloud_event())
            .collect();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            self.notifier.deliver(&connection_id, &events),
        )
        .await
        .unwrap_or_else(|_| BatchResult::failure("delivery timed out"));

        if result.results.is_empty() {
            self.apply_batch_result(&claims, &result).await;
        } else {
            for claim in &claims {
                let per_event = result.results.get(&claim.event.id);
                let effective = match per_event {
                    Some(p) => BatchResult {
                        success: p.success.or(result.success),
                        error: p.error.clone().or_else(|| result.error.clone()),
                        retry_after: p.retry_after.or(result.retry_after),
                        results: HashMap::new(),
                    },
                    None => BatchResult {
                        success: result.success,
                        error: result.error.clone(),
                        retry_after: result.retry_after,
                        results: HashMap::new(),
                    },
                };
                self.apply_batch_result(std::slice::from_ref(claim), &effective)
                    .await;
            }
        }
    }

    async fn apply_batch_result(&self, claims: &[Claim], result: &BatchResult) {
        let delivery_ids: Vec<Uuid> = claims.iter().map(|c| c.delivery.id).collect();

        if let Some(retry_after) = result.retry_after.filter(|ms| *ms > 0) {
            self.metrics
                .deferred_total
                .fetch_add(delivery_ids.len() as u64, Ordering::Relaxed);
            if let Err(err) = self
                .store
                .schedule_retry_no_increment(&delivery_ids, retry_after)
                .await
            {
                tracing::warn!(error = %err, "failed to schedule deferred retry");
            }
            return;
        }

        match result.success {
            Some(true) => {
                self.metrics
                    .delivered_total
                    .fetch_add(delivery_ids.len() as u64, Ordering::Relaxed);
                if let Err(err) = self.store.mark_delivered(&delivery_ids).await {
                    tracing::warn!(error = %err, "failed to mark delivered");
                }
            }
            Some(false) | None => {
                self.metrics
                    .failed_total
                    .fetch_add(delivery_ids.len() as u64, Ordering::Relaxed);
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Subscriber returned success=false".to_string());
                if let Err(err) = self
                    .store
                    .mark_failed(
                        &delivery_ids,
                        &error,
                        self.config.max_attempts,
                        self.config.retry_delay_ms,
                        self.config.max_delay_ms,
                    )
                    .await
                {
                    tracing::warn!(error = %err, "failed to mark failed");
                }
            }
        }
    }
}
