//! Ledger of webhook event ids that have already been handled.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::StorageError;

#[async_trait]
pub trait ProcessedEvents: Send + Sync + 'static {
    async fn contains(&self, event_id: &str) -> Result<bool, StorageError>;

    async fn record(&self, event_id: &str) -> Result<(), StorageError>;
}

/// Redis keys `webhook:event:<id>` with a TTL equal to the retention period.
#[derive(Clone)]
pub struct RedisProcessedEvents {
    conn: MultiplexedConnection,
    retention_secs: u64,
}

impl RedisProcessedEvents {
    pub fn new(conn: MultiplexedConnection, retention_days: u64) -> Self {
        Self { conn, retention_secs: retention_days * 24 * 60 * 60 }
    }

    fn key(event_id: &str) -> String {
        format!("webhook:event:{}", event_id)
    }
}

#[async_trait]
impl ProcessedEvents for RedisProcessedEvents {
    async fn contains(&self, event_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(Self::key(event_id)).await?;
        Ok(found)
    }

    async fn record(&self, event_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(Self::key(event_id), Utc::now().timestamp(), self.retention_secs).await?;
        Ok(())
    }
}

/// In-process ledger; expired ids are purged whenever a new one is recorded.
#[derive(Clone)]
pub struct MemoryProcessedEvents {
    seen: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryProcessedEvents {
    pub fn new(clock: Arc<dyn Clock>, retention_days: u64) -> Self {
        Self {
            seen: Arc::new(Mutex::new(HashMap::new())),
            retention: Duration::days(retention_days as i64),
            clock,
        }
    }
}

#[async_trait]
impl ProcessedEvents for MemoryProcessedEvents {
    async fn contains(&self, event_id: &str) -> Result<bool, StorageError> {
        let cutoff = self.clock.now() - self.retention;
        let seen = self.seen.lock().await;
        Ok(seen.get(event_id).is_some_and(|at| *at > cutoff))
    }

    async fn record(&self, event_id: &str) -> Result<(), StorageError> {
        let now = self.clock.now();
        let cutoff = now - self.retention;
        let mut seen = self.seen.lock().await;
        seen.retain(|_, at| *at > cutoff);
        seen.insert(event_id.to_string(), now);
        Ok(())
    }
}
