//! Booking persistence with compare-and-set updates keyed by booking id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::error::StorageError;
use crate::models::{BookerId, Booking, BookingId, ClassId};

mod memory;
mod postgres;

pub use memory::MemoryBookingStore;
pub use postgres::PgBookingStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("booking {0} not found")]
    NotFound(BookingId),
    #[error("booker already holds active booking {0} for this class")]
    ActiveExists(BookingId),
    #[error("booking {0} was updated by someone else")]
    VersionConflict(BookingId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Storage(StorageError::Database(err))
    }
}

#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError>;

    /// Insert `booking` unless its booker already holds an active booking for
    /// the same class. Check and insert are one atomic step; a loser gets
    /// [`StoreError::ActiveExists`].
    async fn insert_exclusive(&self, booking: &Booking) -> Result<(), StoreError>;

    async fn get(&self, id: BookingId) -> Result<Booking, StoreError>;

    async fn find_by_intent(&self, intent_ref: &str) -> Result<Option<Booking>, StoreError>;

    /// Most recent booking of `booker_id` for `class_id` that still counts as
    /// active (see [`Booking::is_active`]).
    async fn find_active(&self, booker_id: BookerId, class_id: ClassId) -> Result<Option<Booking>, StoreError>;

    async fn list_for_booker(&self, booker_id: BookerId) -> Result<Vec<Booking>, StoreError>;

    /// Bookings waiting on the gateway since before `older_than`, including
    /// cancelled ones whose intent was never resolved.
    async fn list_stale_authorizations(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Persist `booking` only if the stored version still equals
    /// `booking.version`. Returns the stored record with its new version.
    async fn update(&self, booking: &Booking) -> Result<Booking, StoreError>;
}
