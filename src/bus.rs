//! The public facade: owns a `Store`, a `Worker`, and a `NotifyStrategy`
//! and coordinates the publish/subscribe/cancel/ack surface described in
//! the module docs of [`crate`]. Thin by design — everything but the
//! publish-time cron/notify decisions delegates straight to the `Store`.

use crate::config::BusConfig;
use crate::error::{EventBusError, Result};
use crate::notifier::Notifier;
use crate::notify::NotifyStrategy;
use crate::store::Store;
use crate::types::{DesiredSubscription, Event, PublishInput, SubscribeInput, Subscription, SyncResult};
use crate::worker::{Worker, WorkerMetrics};
use eventrelay_cron::CronExpression;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A point-in-time snapshot of the bus's operational state: the worker's
/// delivery counters plus whether the bus is currently running.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMetrics {
    pub running: bool,
    #[serde(flatten)]
    pub worker: WorkerMetrics,
}

/// Owns the durable store, the delivery worker, and the wake-up strategy.
/// Construct with [`Bus::new`], call [`Bus::start`] once the hosting
/// process is ready to begin delivering, and [`Bus::stop`] on shutdown.
pub struct Bus {
    store: Arc<dyn Store>,
    worker: Arc<Worker>,
    notify_strategy: Arc<dyn NotifyStrategy>,
    running: AtomicBool,
}

impl Bus {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        notify_strategy: Arc<dyn NotifyStrategy>,
        config: BusConfig,
    ) -> Self {
        let worker = Arc::new(Worker::new(
            store.clone(),
            notifier,
            notify_strategy.clone(),
            config,
        ));
        Self {
            store,
            worker,
            notify_strategy,
            running: AtomicBool::new(false),
        }
    }

    /// Idempotent. Resets stuck deliveries, starts the worker's wake loop,
    /// and runs one immediate pass so work published before startup (or
    /// left over from a crash) is picked up without waiting for the first
    /// poll tick.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.worker.start().await?;
        self.worker.process_now().await?;
        Ok(())
    }

    /// Idempotent. Stops the worker's wake loop and releases the
    /// notify strategy's resources. An in-flight `process_now` batch is
    /// allowed to finish its writes before the worker task exits.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.worker.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// A snapshot combining whether the bus is running with the worker's
    /// claimed/delivered/failed/deferred counters.
    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            running: self.is_running(),
            worker: self.worker.metrics(),
        }
    }

    /// Publishes a new event. Fails with `InvalidInput` if both `deliverAt`
    /// and `cron` are supplied, or if `cron` fails to parse. Deliveries are
    /// inserted immediately; the notify strategy is only nudged when the
    /// delivery is due now (no `deliverAt`, no `cron` — scheduled retries
    /// and scheduled first-runs wait for polling, same as the worker's own
    /// retry path).
    pub async fn publish(
        &self,
        org_id: &str,
        publisher_connection_id: &str,
        input: PublishInput,
    ) -> Result<Event> {
        if input.deliver_at.is_some() && input.cron.is_some() {
            return Err(EventBusError::InvalidInput(
                "deliverAt and cron are mutually exclusive".to_string(),
            ));
        }

        let first_run = match &input.cron {
            Some(expr) => {
                let parsed = CronExpression::parse(expr).map_err(EventBusError::InvalidCron)?;
                Some(parsed.next_after(crate::types::now()).ok_or_else(|| {
                    EventBusError::InvalidInput(format!(
                        "cron expression {expr} has no future occurrence"
                    ))
                })?)
            }
            None => None,
        };

        let deliver_at = first_run.or(input.deliver_at);
        let (event, is_new) = self
            .store
            .insert_event(org_id, publisher_connection_id, input)
            .await?;

        // A cron idempotent hit returns the already-active event; its
        // deliveries were inserted by the publish call that created it.
        if is_new {
            let subscriptions = self.store.match_subscriptions(&event).await?;
            if !subscriptions.is_empty() {
                let subscription_ids: Vec<Uuid> = subscriptions.iter().map(|s| s.id).collect();
                self.store
                    .insert_deliveries(event.id, &subscription_ids, deliver_at)
                    .await?;
            }
        }

        if is_new && deliver_at.is_none() {
            if let Err(err) = self.notify_strategy.notify().await {
                tracing::warn!(error = %err, event_id = %event.id, "notify strategy failed after publish");
            }
        }

        Ok(event)
    }

    pub async fn subscribe(&self, org_id: &str, input: SubscribeInput) -> Result<Subscription> {
        self.store.subscribe(org_id, input).await
    }

    pub async fn unsubscribe(&self, org_id: &str, subscription_id: Uuid) -> Result<bool> {
        self.store.unsubscribe(subscription_id, org_id).await
    }

    pub async fn list_subscriptions(
        &self,
        org_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Vec<Subscription>> {
        self.store.list_subscriptions(org_id, connection_id).await
    }

    pub async fn get_subscription(
        &self,
        org_id: &str,
        id: Uuid,
    ) -> Result<Option<Subscription>> {
        self.store.get_subscription(org_id, id).await
    }

    pub async fn get_event(&self, org_id: &str, id: Uuid) -> Result<Option<Event>> {
        self.store.get_event(org_id, id).await
    }

    /// Only the publisher that created the event may cancel it. Returns
    /// `false` (not an error) if the event is missing, cross-tenant,
    /// owned by a different connection, or already terminal.
    pub async fn cancel_event(
        &self,
        org_id: &str,
        event_id: Uuid,
        caller_connection_id: &str,
    ) -> Result<bool> {
        self.store
            .cancel_event(event_id, org_id, caller_connection_id)
            .await
    }

    /// Flips any non-terminal deliveries whose subscription belongs to
    /// `subscriber_connection_id` to `delivered`, then rolls up the
    /// event's status. Used when a subscriber previously deferred with
    /// `retryAfter` and now wants to confirm out of band.
    pub async fn ack_event(
        &self,
        org_id: &str,
        event_id: Uuid,
        subscriber_connection_id: &str,
    ) -> Result<bool> {
        self.store
            .ack_delivery(event_id, org_id, subscriber_connection_id)
            .await
    }

    pub async fn sync_subscriptions(
        &self,
        org_id: &str,
        connection_id: &str,
        desired: Vec<DesiredSubscription>,
    ) -> Result<SyncResult> {
        self.store
            .sync_subscriptions(org_id, connection_id, desired)
            .await
    }
}
