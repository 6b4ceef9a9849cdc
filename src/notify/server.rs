//! Postgres `LISTEN`/`NOTIFY` push channel. Only available to deployments
//! backed by `PostgresStore` — `SqliteStore::supports_listen_notify()`
//! returns `false`, so a `SqliteStore` deployment never selects this
//! strategy (see `config::NotifyStrategyKind::Auto`'s selection policy).

use super::NotifyStrategy;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

pub struct ServerNotifyStrategy {
    pool: PgPool,
    channel: String,
    running: Arc<RwLock<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerNotifyStrategy {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            running: Arc::new(RwLock::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl NotifyStrategy for ServerNotifyStrategy {
    async fn start(&self, wake: Arc<Notify>) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        *self.running.write().await = true;
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }
                match listener.recv().await {
                    Ok(_) => wake.notify_one(),
                    Err(err) => {
                        tracing::warn!(error = %err, "server notify listener error, retrying");
                    }
                }
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.running.write().await = false;
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn notify(&self) -> Result<()> {
        sqlx::query(&format!("NOTIFY {}", self.channel))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
