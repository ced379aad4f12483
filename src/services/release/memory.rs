use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{ReleaseEntry, ReleaseSchedule, ReleaseState};
use crate::error::StorageError;
use crate::models::BookingId;

#[derive(Debug, Clone, Default)]
pub struct MemoryReleaseSchedule {
    entries: Arc<Mutex<HashMap<BookingId, ReleaseEntry>>>,
}

impl MemoryReleaseSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    fn holds_lease(entry: &ReleaseEntry, owner: &str) -> bool {
        entry.state == ReleaseState::Scheduled && entry.lease_owner.as_deref() == Some(owner)
    }
}

#[async_trait]
impl ReleaseSchedule for MemoryReleaseSchedule {
    async fn upsert(&self, booking_id: BookingId, release_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.entries.lock().await.insert(
            booking_id,
            ReleaseEntry {
                booking_id,
                release_at,
                state: ReleaseState::Scheduled,
                attempts: 0,
                next_attempt_at: None,
                last_error: None,
                lease_owner: None,
                lease_until: None,
            },
        );
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReleaseEntry>, StorageError> {
        let mut entries = self.entries.lock().await;
        let mut due: Vec<&mut ReleaseEntry> = entries
            .values_mut()
            .filter(|e| e.state == ReleaseState::Scheduled && e.due_at() <= now)
            .filter(|e| e.lease_until.map_or(true, |until| until < now))
            .collect();
        due.sort_by_key(|e| e.release_at);

        let claimed: Vec<ReleaseEntry> = due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|entry| {
                entry.lease_owner = Some(owner.to_string());
                entry.lease_until = Some(lease_until);
                entry.attempts += 1;
                entry.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn finish(
        &self,
        booking_id: BookingId,
        owner: &str,
        state: ReleaseState,
        note: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&booking_id).filter(|e| Self::holds_lease(e, owner)) {
            entry.state = state;
            entry.last_error = note.map(str::to_string);
            entry.lease_owner = None;
            entry.lease_until = None;
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        booking_id: BookingId,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&booking_id).filter(|e| Self::holds_lease(e, owner)) {
            entry.last_error = Some(error.to_string());
            entry.next_attempt_at = Some(next_attempt_at);
            entry.lease_owner = None;
            entry.lease_until = None;
        }
        Ok(())
    }

    async fn flag(&self, booking_id: BookingId, at: DateTime<Utc>, note: &str) -> Result<(), StorageError> {
        self.entries.lock().await.insert(
            booking_id,
            ReleaseEntry {
                booking_id,
                release_at: at,
                state: ReleaseState::NeedsReconciliation,
                attempts: 0,
                next_attempt_at: None,
                last_error: Some(note.to_string()),
                lease_owner: None,
                lease_until: None,
            },
        );
        Ok(())
    }

    async fn get(&self, booking_id: BookingId) -> Result<Option<ReleaseEntry>, StorageError> {
        Ok(self.entries.lock().await.get(&booking_id).cloned())
    }

    async fn count_scheduled(&self) -> Result<i64, StorageError> {
        let entries = self.entries.lock().await;
        Ok(entries.values().filter(|e| e.state == ReleaseState::Scheduled).count() as i64)
    }
}
