//! Read-only view of class sessions owned by the listings subsystem.

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::models::class_session::ClassSessionRow;
use crate::models::{ClassId, ClassSession};

#[async_trait]
pub trait ClassCatalog: Send + Sync + 'static {
    async fn session(&self, class_id: ClassId) -> Result<Option<ClassSession>, StorageError>;
}

#[derive(Clone)]
pub struct PgClassCatalog {
    pool: PgPool,
}

impl PgClassCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClassCatalog for PgClassCatalog {
    async fn session(&self, class_id: ClassId) -> Result<Option<ClassSession>, StorageError> {
        let row: Option<ClassSessionRow> = sqlx::query_as(
            "SELECT id, max_capacity, current_booked_count, session_start, base_price
             FROM class_sessions WHERE id = $1",
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ClassSession::from))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryClassCatalog {
    sessions: Arc<RwLock<HashMap<ClassId, ClassSession>>>,
}

impl MemoryClassCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: ClassSession) {
        self.sessions.write().await.insert(session.id, session);
    }
}

#[async_trait]
impl ClassCatalog for MemoryClassCatalog {
    async fn session(&self, class_id: ClassId) -> Result<Option<ClassSession>, StorageError> {
        Ok(self.sessions.read().await.get(&class_id).cloned())
    }
}
