//! Per-class participant counters.
//!
//! `try_admit` is the only read-modify-write in the system that several
//! bookers race on, so every implementation must perform the
//! check-and-increment atomically:
//! - Postgres: a single conditional `UPDATE ... RETURNING`
//! - In-memory: one `tokio::sync::Mutex` around the counters

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::error::StorageError;
use crate::models::ClassId;

mod memory;
mod postgres;

pub use memory::MemoryCapacityLedger;
pub use postgres::PgCapacityLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("class {0} is not known to the capacity ledger")]
    UnknownClass(ClassId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(StorageError::Database(err))
    }
}

/// Result of an admission attempt. A full class is `admitted: false`,
/// never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    pub booked: u32,
    pub max_capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacitySnapshot {
    pub booked: u32,
    pub max_capacity: u32,
}

impl CapacitySnapshot {
    pub fn remaining(&self) -> u32 {
        self.max_capacity.saturating_sub(self.booked)
    }
}

#[async_trait]
pub trait CapacityLedger: Send + Sync + 'static {
    /// Atomically reserve `participants` seats if they fit.
    async fn try_admit(&self, class_id: ClassId, participants: u32) -> Result<Admission, LedgerError>;

    /// Hand seats back, never dropping below zero. Callers guard against
    /// releasing the same booking twice.
    async fn release(&self, class_id: ClassId, participants: u32) -> Result<(), LedgerError>;

    async fn snapshot(&self, class_id: ClassId) -> Result<CapacitySnapshot, LedgerError>;
}
