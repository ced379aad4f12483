//! Error taxonomy shared by the lifecycle, webhook and scheduler layers.
//!
//! Business outcomes (class full, duplicate booking, illegal transition) are
//! distinct variants so callers can branch on them; only `Storage` and
//! transient `Gateway` errors are faults.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::models::{BookingId, BookingStatus, ClassId, PaymentStatus};
use crate::services::ledger::LedgerError;
use crate::services::payment::GatewayError;
use crate::services::store::StoreError;

/// Machine-checkable category surfaced next to every user-visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    CapacityExceeded,
    DuplicateBooking,
    StateConflict,
    Conflict,
    Gateway,
    Storage,
}

/// Failures of the persistence backends (Postgres, Redis).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Current booking state as reported by a failed guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingState {
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.status, self.payment_status)
    }
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),

    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("class {0} not found")]
    ClassNotFound(ClassId),

    #[error("class {0} is full")]
    CapacityExceeded(ClassId),

    #[error("an active booking {existing} already exists for this class")]
    DuplicateBooking { existing: BookingId },

    #[error("booking {booking_id} is {current}, expected {expected}")]
    StateConflict {
        booking_id: BookingId,
        current: BookingState,
        expected: &'static str,
    },

    #[error("booking {0} was modified concurrently, retry the request")]
    ConcurrentModification(BookingId),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BookingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BookingError::Validation(_) => ErrorKind::Validation,
            BookingError::BookingNotFound(_) | BookingError::ClassNotFound(_) => ErrorKind::NotFound,
            BookingError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            BookingError::DuplicateBooking { .. } => ErrorKind::DuplicateBooking,
            BookingError::StateConflict { .. } => ErrorKind::StateConflict,
            BookingError::ConcurrentModification(_) => ErrorKind::Conflict,
            BookingError::Gateway(_) => ErrorKind::Gateway,
            BookingError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Message safe to show to API callers. Internal faults are replaced by a
    /// generic reason; the details only go to the logs.
    pub fn public_message(&self) -> String {
        match self {
            BookingError::CapacityExceeded(_) => "class is full".to_string(),
            BookingError::Storage(_) => "internal storage error".to_string(),
            BookingError::Gateway(e) if e.transient => {
                "payment gateway temporarily unavailable, retry later".to_string()
            }
            BookingError::Gateway(e) => format!("payment was declined: {}", e.message),
            other => other.to_string(),
        }
    }
}

impl From<LedgerError> for BookingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownClass(class_id) => BookingError::ClassNotFound(class_id),
            LedgerError::Storage(e) => BookingError::Storage(e),
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => BookingError::BookingNotFound(id),
            StoreError::ActiveExists(existing) => BookingError::DuplicateBooking { existing },
            StoreError::VersionConflict(id) => BookingError::ConcurrentModification(id),
            StoreError::Storage(e) => BookingError::Storage(e),
        }
    }
}

pub type BookingResult<T> = Result<T, BookingError>;
