//! `NotifyStrategy`: how the Worker learns a delivery became eligible
//! without waiting out its full poll interval.
//!
//! Every strategy is safe to run alone (a Worker falls back to its own
//! polling ticker regardless), so `Polling` is both a strategy in its own
//! right and the fallback every other strategy is `Compose`d with.

pub mod bus;
pub mod compose;
pub mod polling;
pub mod server;

use crate::config::{BusConfig, NotifyStrategyKind};
use crate::error::{EventBusError, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Notify;

/// A push channel a Worker can ride to wake up sooner than its poll
/// interval. `start` hands the strategy a shared [`Notify`]; it calls
/// `wake.notify_one()` whenever it learns work may be ready.
#[async_trait]
pub trait NotifyStrategy: Send + Sync {
    /// Begin listening. Must return once subscribed; any long-running listen
    /// loop runs in a spawned background task.
    async fn start(&self, wake: Arc<Notify>) -> Result<()>;

    /// Stop the background listen loop, if any. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Publish a wake signal. Called by `Bus::publish` right after a
    /// delivery becomes eligible. `Polling` treats this as a no-op.
    async fn notify(&self) -> Result<()>;
}

/// Implements the selection policy from the notify-strategy design: an
/// explicit [`NotifyStrategyKind`] overrides auto-detection; otherwise
/// prefer `Bus` if a bus URL is configured, else `Server` if the store
/// supports `LISTEN`/`NOTIFY`, else `Polling`. Every non-polling selection
/// is composed with `Polling` as a safety net, so a dropped NATS
/// connection or a missed `LISTEN` delivery is still covered by the next
/// poll tick.
///
/// `postgres_pool` is only consulted when the resolved kind is `Server`;
/// callers not running `PostgresStore` can pass `None` and will get a
/// configuration error if `Server` is explicitly requested.
pub async fn build_strategy(
    config: &BusConfig,
    supports_listen_notify: bool,
    postgres_pool: Option<PgPool>,
) -> Result<Arc<dyn NotifyStrategy>> {
    let resolved = match config.notify_strategy {
        NotifyStrategyKind::Auto => {
            if config.bus_url.is_some() {
                NotifyStrategyKind::Bus
            } else if supports_listen_notify {
                NotifyStrategyKind::Server
            } else {
                NotifyStrategyKind::Polling
            }
        }
        explicit => explicit,
    };

    match resolved {
        NotifyStrategyKind::Polling => Ok(Arc::new(polling::PollingNotifyStrategy::new())),

        NotifyStrategyKind::Server => {
            let pool = postgres_pool.ok_or_else(|| {
                EventBusError::Configuration(
                    "server notify strategy requires a Postgres pool".to_string(),
                )
            })?;
            let server = server::ServerNotifyStrategy::new(pool, config.server_notify_channel.clone());
            Ok(Arc::new(compose::ComposeNotifyStrategy::new(vec![
                Box::new(server),
                Box::new(polling::PollingNotifyStrategy::new()),
            ])))
        }

        NotifyStrategyKind::Bus => {
            let url = config.bus_url.as_deref().ok_or_else(|| {
                EventBusError::Configuration(
                    "bus notify strategy requires EVENTRELAY_BUS_URL".to_string(),
                )
            })?;
            let client = async_nats::connect(url)
                .await
                .map_err(|e| EventBusError::Configuration(format!("failed to connect to bus: {e}")))?;
            let strategy = bus::BusNotifyStrategy::new(client, config.bus_notify_subject.clone());
            Ok(Arc::new(compose::ComposeNotifyStrategy::new(vec![
                Box::new(strategy),
                Box::new(polling::PollingNotifyStrategy::new()),
            ])))
        }

        NotifyStrategyKind::Auto => unreachable!("resolved above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_falls_back_to_polling_with_no_bus_url_and_no_listen_notify_support() {
        let config = BusConfig::default();
        let strategy = build_strategy(&config, false, None).await.unwrap();
        strategy.notify().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_polling_ignores_listen_notify_support() {
        let mut config = BusConfig::default();
        config.notify_strategy = NotifyStrategyKind::Polling;
        let strategy = build_strategy(&config, true, None).await.unwrap();
        strategy.notify().await.unwrap();
    }

    #[tokio::test]
    async fn server_without_a_pool_is_a_configuration_error() {
        let mut config = BusConfig::default();
        config.notify_strategy = NotifyStrategyKind::Server;
        let err = build_strategy(&config, true, None).await.unwrap_err();
        assert!(matches!(err, EventBusError::Configuration(_)));
    }

    #[tokio::test]
    async fn bus_without_a_url_is_a_configuration_error() {
        let mut config = BusConfig::default();
        config.notify_strategy = NotifyStrategyKind::Bus;
        let err = build_strategy(&config, false, None).await.unwrap_err();
        assert!(matches!(err, EventBusError::Configuration(_)));
    }

    #[tokio::test]
    async fn auto_prefers_server_over_polling_when_listen_notify_is_supported_but_no_pool_given() {
        // Auto resolves to Server (listen/notify supported, no bus URL), which then
        // requires a pool — this documents that Auto's resolution still needs the
        // pool wired up by the caller, not a silent fallback to Polling.
        let config = BusConfig::default();
        let err = build_strategy(&config, true, None).await.unwrap_err();
        assert!(matches!(err, EventBusError::Configuration(_)));
    }
}
