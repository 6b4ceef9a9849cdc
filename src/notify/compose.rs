//! Runs several `NotifyStrategy`s side by side, e.g. `ServerNotify` or
//! `BusNotify` layered over `Polling` as a safety net: if the push channel
//! drops a message, the Worker's poll ticker still finds the work.

use super::NotifyStrategy;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;

pub struct ComposeNotifyStrategy {
    strategies: Vec<Box<dyn NotifyStrategy>>,
}

impl ComposeNotifyStrategy {
    pub fn new(strategies: Vec<Box<dyn NotifyStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl NotifyStrategy for ComposeNotifyStrategy {
    async fn start(&self, wake: Arc<Notify>) -> Result<()> {
        for strategy in &self.strategies {
            strategy.start(wake.clone()).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        for strategy in &self.strategies {
            if let Err(err) = strategy.stop().await {
                tracing::warn!(error = %err, "notify strategy failed to stop cleanly");
            }
        }
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        for strategy in &self.strategies {
            if let Err(err) = strategy.notify().await {
                tracing::warn!(error = %err, "notify strategy failed to publish wake signal");
            }
        }
        Ok(())
    }
}
