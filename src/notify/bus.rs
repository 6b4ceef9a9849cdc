//! NATS-backed push channel, for deployments that already run a message
//! bus alongside the event store. Reconnection is delegated entirely to
//! `async_nats::Client`, same as the teacher's NATS-backed provider.

use super::NotifyStrategy;
use crate::error::Result;
use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

pub struct BusNotifyStrategy {
    client: Client,
    subject: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BusNotifyStrategy {
    pub fn new(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl NotifyStrategy for BusNotifyStrategy {
    async fn start(&self, wake: Arc<Notify>) -> Result<()> {
        let mut subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| crate::error::EventBusError::DeliveryFailure(e.to_string()))?;

        let handle = tokio::spawn(async move {
            while subscriber.next().await.is_some() {
                wake.notify_one();
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        self.client
            .publish(self.subject.clone(), "".into())
            .await
            .map_err(|e| crate::error::EventBusError::DeliveryFailure(e.to_string()))?;
        Ok(())
    }
}
