use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Admission, CapacityLedger, CapacitySnapshot, LedgerError};
use crate::models::ClassId;

#[derive(Debug, Clone, Copy)]
struct Counter {
    max_capacity: u32,
    booked: u32,
}

/// Single-node ledger guarded by one Tokio mutex.
#[derive(Debug, Clone, Default)]
pub struct MemoryCapacityLedger {
    counters: Arc<Mutex<HashMap<ClassId, Counter>>>,
}

impl MemoryCapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a class known to the ledger. Re-registering keeps the current
    /// booked count and only updates the maximum.
    pub async fn register(&self, class_id: ClassId, max_capacity: u32) {
        let mut counters = self.counters.lock().await;
        counters
            .entry(class_id)
            .and_modify(|c| c.max_capacity = max_capacity)
            .or_insert(Counter { max_capacity, booked: 0 });
    }
}

#[async_trait]
impl CapacityLedger for MemoryCapacityLedger {
    async fn try_admit(&self, class_id: ClassId, participants: u32) -> Result<Admission, LedgerError> {
        let mut counters = self.counters.lock().await;
        let counter = counters.get_mut(&class_id).ok_or(LedgerError::UnknownClass(class_id))?;

        let fits = counter
            .booked
            .checked_add(participants)
            .is_some_and(|total| total <= counter.max_capacity);
        if fits {
            counter.booked += participants;
        }

        debug!(
            class_id = %class_id,
            participants,
            booked = counter.booked,
            max = counter.max_capacity,
            admitted = fits,
            "Admission checked"
        );

        Ok(Admission { admitted: fits, booked: counter.booked, max_capacity: counter.max_capacity })
    }

    async fn release(&self, class_id: ClassId, participants: u32) -> Result<(), LedgerError> {
        let mut counters = self.counters.lock().await;
        let counter = counters.get_mut(&class_id).ok_or(LedgerError::UnknownClass(class_id))?;

        if counter.booked < participants {
            warn!(
                class_id = %class_id,
                booked = counter.booked,
                participants,
                "Releasing more seats than booked, flooring at zero"
            );
        }
        counter.booked = counter.booked.saturating_sub(participants);
        Ok(())
    }

    async fn snapshot(&self, class_id: ClassId) -> Result<CapacitySnapshot, LedgerError> {
        let counters = self.counters.lock().await;
        let counter = counters.get(&class_id).ok_or(LedgerError::UnknownClass(class_id))?;
        Ok(CapacitySnapshot { booked: counter.booked, max_capacity: counter.max_capacity })
    }
}
