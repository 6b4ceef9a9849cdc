//! The baseline strategy: no push channel at all. The Worker's own poll
//! ticker is the only wake source, so `notify()` rides the same `Notify`
//! handle the Worker hands to `start()` to give same-process publishes a
//! faster path than waiting out the full poll interval.

use super::NotifyStrategy;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Default)]
pub struct PollingNotifyStrategy {
    wake: Mutex<Option<Arc<Notify>>>,
}

impl PollingNotifyStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotifyStrategy for PollingNotifyStrategy {
    async fn start(&self, wake: Arc<Notify>) -> Result<()> {
        *self.wake.lock().await = Some(wake);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.wake.lock().await = None;
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        if let Some(wake) = self.wake.lock().await.as_ref() {
            wake.notify_one();
        }
        Ok(())
    }
}
