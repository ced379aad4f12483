use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use super::{ReleaseEntry, ReleaseSchedule, ReleaseState};
use crate::error::StorageError;
use crate::models::BookingId;

const ENTRY_COLUMNS: &str =
    "booking_id, release_at, state, attempts, next_attempt_at, last_error, lease_owner, lease_until";

#[derive(Debug, FromRow)]
struct EntryRow {
    booking_id: BookingId,
    release_at: DateTime<Utc>,
    state: String,
    attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    lease_owner: Option<String>,
    lease_until: Option<DateTime<Utc>>,
}

impl TryFrom<EntryRow> for ReleaseEntry {
    type Error = StorageError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse()
            .map_err(|e| StorageError::Corrupt(format!("release entry {}: {}", row.booking_id, e)))?;
        Ok(ReleaseEntry {
            booking_id: row.booking_id,
            release_at: row.release_at,
            state,
            attempts: row.attempts.max(0) as u32,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            lease_owner: row.lease_owner,
            lease_until: row.lease_until,
        })
    }
}

/// Schedule stored in `release_schedule`. Claims use `FOR UPDATE SKIP LOCKED`
/// so several workers can sweep the same table without double-claiming.
#[derive(Clone)]
pub struct PgReleaseSchedule {
    pool: PgPool,
}

impl PgReleaseSchedule {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReleaseSchedule for PgReleaseSchedule {
    async fn upsert(&self, booking_id: BookingId, release_at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO release_schedule (booking_id, release_at, state, attempts)
            VALUES ($1, $2, 'scheduled', 0)
            ON CONFLICT (booking_id) DO UPDATE SET
                release_at = EXCLUDED.release_at,
                state = 'scheduled',
                attempts = 0,
                next_attempt_at = NULL,
                last_error = NULL,
                lease_owner = NULL,
                lease_until = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(booking_id)
        .bind(release_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReleaseEntry>, StorageError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            r#"
            UPDATE release_schedule
            SET lease_owner = $2, lease_until = $3, attempts = attempts + 1, updated_at = NOW()
            WHERE booking_id IN (
                SELECT booking_id FROM release_schedule
                WHERE state = 'scheduled'
                  AND COALESCE(next_attempt_at, release_at) <= $1
                  AND (lease_until IS NULL OR lease_until < $1)
                ORDER BY release_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(owner)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReleaseEntry::try_from).collect()
    }

    async fn finish(
        &self,
        booking_id: BookingId,
        owner: &str,
        state: ReleaseState,
        note: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE release_schedule
            SET state = $3, last_error = $4, lease_owner = NULL, lease_until = NULL, updated_at = NOW()
            WHERE booking_id = $1 AND lease_owner = $2 AND state = 'scheduled'
            "#,
        )
        .bind(booking_id)
        .bind(owner)
        .bind(state.as_str())
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry_later(
        &self,
        booking_id: BookingId,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE release_schedule
            SET next_attempt_at = $3, last_error = $4, lease_owner = NULL, lease_until = NULL, updated_at = NOW()
            WHERE booking_id = $1 AND lease_owner = $2 AND state = 'scheduled'
            "#,
        )
        .bind(booking_id)
        .bind(owner)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn flag(&self, booking_id: BookingId, at: DateTime<Utc>, note: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO release_schedule (booking_id, release_at, state, attempts, last_error)
            VALUES ($1, $2, 'needs_reconciliation', 0, $3)
            ON CONFLICT (booking_id) DO UPDATE SET
                state = 'needs_reconciliation',
                last_error = EXCLUDED.last_error,
                next_attempt_at = NULL,
                lease_owner = NULL,
                lease_until = NULL,
                updated_at = NOW()
            "#,
        )
        .bind(booking_id)
        .bind(at)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, booking_id: BookingId) -> Result<Option<ReleaseEntry>, StorageError> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM release_schedule WHERE booking_id = $1"
        ))
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReleaseEntry::try_from).transpose()
    }

    async fn count_scheduled(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM release_schedule WHERE state = 'scheduled'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
