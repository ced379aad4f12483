use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{Admission, CapacityLedger, CapacitySnapshot, LedgerError};
use crate::models::ClassId;

/// Ledger backed by the `class_sessions` row of each class. The check and
/// the increment happen in one conditional `UPDATE`, so concurrent
/// admissions for the same row serialize on the row lock.
#[derive(Clone)]
pub struct PgCapacityLedger {
    pool: PgPool,
}

impl PgCapacityLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CapacityLedger for PgCapacityLedger {
    async fn try_admit(&self, class_id: ClassId, participants: u32) -> Result<Admission, LedgerError> {
        let admitted: Option<(i32, i32)> = sqlx::query_as(
            r#"
            UPDATE class_sessions
            SET current_booked_count = current_booked_count + $2, updated_at = NOW()
            WHERE id = $1 AND current_booked_count + $2 <= max_capacity
            RETURNING current_booked_count, max_capacity
            "#,
        )
        .bind(class_id)
        .bind(participants as i32)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((booked, max_capacity)) = admitted {
            debug!(class_id = %class_id, booked, max_capacity, "Seats admitted");
            return Ok(Admission { admitted: true, booked: booked as u32, max_capacity: max_capacity as u32 });
        }

        // Either the class is full or it does not exist.
        let snapshot = self.snapshot(class_id).await?;
        Ok(Admission { admitted: false, booked: snapshot.booked, max_capacity: snapshot.max_capacity })
    }

    async fn release(&self, class_id: ClassId, participants: u32) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE class_sessions
            SET current_booked_count = GREATEST(current_booked_count - $2, 0), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(class_id)
        .bind(participants as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::UnknownClass(class_id));
        }
        Ok(())
    }

    async fn snapshot(&self, class_id: ClassId) -> Result<CapacitySnapshot, LedgerError> {
        let row: Option<(i32, i32)> = sqlx::query_as(
            "SELECT current_booked_count, max_capacity FROM class_sessions WHERE id = $1",
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;

        let (booked, max_capacity) = row.ok_or(LedgerError::UnknownClass(class_id))?;
        Ok(CapacitySnapshot { booked: booked.max(0) as u32, max_capacity: max_capacity.max(0) as u32 })
    }
}
