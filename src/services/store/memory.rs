use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{BookingStore, StoreError};
use crate::models::{BookerId, Booking, BookingId, BookingStatus, ClassId, PaymentStatus};

#[derive(Debug, Clone, Default)]
pub struct MemoryBookingStore {
    bookings: Arc<RwLock<HashMap<BookingId, Booking>>>,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError> {
        self.bookings.write().await.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn insert_exclusive(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut bookings = self.bookings.write().await;
        if let Some(existing) = bookings
            .values()
            .find(|b| b.booker_id == booking.booker_id && b.class_id == booking.class_id && b.is_active())
        {
            return Err(StoreError::ActiveExists(existing.id));
        }
        bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get(&self, id: BookingId) -> Result<Booking, StoreError> {
        self.bookings.read().await.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn find_by_intent(&self, intent_ref: &str) -> Result<Option<Booking>, StoreError> {
        let bookings = self.bookings.read().await;
        Ok(bookings
            .values()
            .find(|b| b.payment_intent_ref.as_deref() == Some(intent_ref))
            .cloned())
    }

    async fn find_active(&self, booker_id: BookerId, class_id: ClassId) -> Result<Option<Booking>, StoreError> {
        let bookings = self.bookings.read().await;
        Ok(bookings
            .values()
            .filter(|b| b.booker_id == booker_id && b.class_id == class_id && b.is_active())
            .max_by_key(|b| b.created_at)
            .cloned())
    }

    async fn list_for_booker(&self, booker_id: BookerId) -> Result<Vec<Booking>, StoreError> {
        let bookings = self.bookings.read().await;
        let mut found: Vec<Booking> = bookings.values().filter(|b| b.booker_id == booker_id).cloned().collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn list_stale_authorizations(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let bookings = self.bookings.read().await;
        let mut stale: Vec<Booking> = bookings
            .values()
            .filter(|b| {
                matches!(b.status, BookingStatus::Pending | BookingStatus::Cancelled)
                    && b.payment_status == PaymentStatus::AuthorizationPending
                    && b.updated_at < older_than
            })
            .cloned()
            .collect();
        stale.sort_by_key(|b| b.updated_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn update(&self, booking: &Booking) -> Result<Booking, StoreError> {
        let mut bookings = self.bookings.write().await;
        let stored = bookings.get_mut(&booking.id).ok_or(StoreError::NotFound(booking.id))?;
        if stored.version != booking.version {
            return Err(StoreError::VersionConflict(booking.id));
        }
        let mut next = booking.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }
}
