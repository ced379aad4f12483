use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use super::{BookingStore, StoreError};
use crate::error::StorageError;
use crate::models::{BookerId, Booking, BookingId, ClassId, Money, Participant, Pricing};

const BOOKING_COLUMNS: &str = r#"
    id, class_id, booker_id, participants, session_start, special_requests,
    base_price, service_fee, total_amount, status, payment_status,
    payment_intent_ref, charge_ref, payment_date, class_completed_at,
    funds_release_date, funds_released, funds_released_at, cancelled_at,
    cancellation_reason, refund_amount, created_at, updated_at, version
"#;

#[derive(Debug, FromRow)]
struct BookingRow {
    id: BookingId,
    class_id: ClassId,
    booker_id: BookerId,
    participants: Json<Vec<Participant>>,
    session_start: DateTime<Utc>,
    special_requests: Option<String>,
    base_price: i64,
    service_fee: i64,
    total_amount: i64,
    status: String,
    payment_status: String,
    payment_intent_ref: Option<String>,
    charge_ref: Option<String>,
    payment_date: Option<DateTime<Utc>>,
    class_completed_at: Option<DateTime<Utc>>,
    funds_release_date: Option<DateTime<Utc>>,
    funds_released: bool,
    funds_released_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    refund_amount: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StorageError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StorageError::Corrupt(format!("booking {}: {}", row.id, e)))?;
        let payment_status = row
            .payment_status
            .parse()
            .map_err(|e| StorageError::Corrupt(format!("booking {}: {}", row.id, e)))?;

        Ok(Booking {
            id: row.id,
            class_id: row.class_id,
            booker_id: row.booker_id,
            participants: row.participants.0,
            session_start: row.session_start,
            special_requests: row.special_requests,
            pricing: Pricing {
                base_price: Money::from_minor(row.base_price),
                service_fee: Money::from_minor(row.service_fee),
                total_amount: Money::from_minor(row.total_amount),
            },
            status,
            payment_status,
            payment_intent_ref: row.payment_intent_ref,
            charge_ref: row.charge_ref,
            payment_date: row.payment_date,
            class_completed_at: row.class_completed_at,
            funds_release_date: row.funds_release_date,
            funds_released: row.funds_released,
            funds_released_at: row.funds_released_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            refund_amount: row.refund_amount.map(Money::from_minor),
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

fn into_bookings(rows: Vec<BookingRow>) -> Result<Vec<Booking>, StoreError> {
    rows.into_iter()
        .map(|row| Booking::try_from(row).map_err(StoreError::from))
        .collect()
}

fn insert_booking(booking: &Booking) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO bookings (
            id, class_id, booker_id, participants, session_start, special_requests,
            base_price, service_fee, total_amount, status, payment_status,
            funds_released, created_at, updated_at, version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(booking.id)
    .bind(booking.class_id)
    .bind(booking.booker_id)
    .bind(Json(booking.participants.clone()))
    .bind(booking.session_start)
    .bind(booking.special_requests.clone())
    .bind(booking.pricing.base_price.minor_units())
    .bind(booking.pricing.service_fee.minor_units())
    .bind(booking.pricing.total_amount.minor_units())
    .bind(booking.status.as_str())
    .bind(booking.payment_status.as_str())
    .bind(booking.funds_released)
    .bind(booking.created_at)
    .bind(booking.updated_at)
    .bind(booking.version)
}

#[derive(Clone)]
pub struct PgBookingStore {
    pool: PgPool,
}

impl PgBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError> {
        insert_booking(booking).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_exclusive(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent inserts for the same (booker, class) pair.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("booking:{}:{}", booking.booker_id, booking.class_id))
            .execute(&mut *tx)
            .await?;

        let existing: Option<BookingId> = sqlx::query_scalar(
            r#"
            SELECT id FROM bookings
            WHERE booker_id = $1 AND class_id = $2
              AND status <> 'cancelled' AND payment_status <> 'failed'
            LIMIT 1
            "#,
        )
        .bind(booking.booker_id)
        .bind(booking.class_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(existing) = existing {
            return Err(StoreError::ActiveExists(existing));
        }

        insert_booking(booking).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: BookingId) -> Result<Booking, StoreError> {
        let row: Option<BookingRow> =
            sqlx::query_as(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        let row = row.ok_or(StoreError::NotFound(id))?;
        Ok(Booking::try_from(row)?)
    }

    async fn find_by_intent(&self, intent_ref: &str) -> Result<Option<Booking>, StoreError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE payment_intent_ref = $1"
        ))
        .bind(intent_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Booking::try_from).transpose()?)
    }

    async fn find_active(&self, booker_id: BookerId, class_id: ClassId) -> Result<Option<Booking>, StoreError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {BOOKING_COLUMNS} FROM bookings
            WHERE booker_id = $1 AND class_id = $2
              AND status <> 'cancelled' AND payment_status <> 'failed'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(booker_id)
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Booking::try_from).transpose()?)
    }

    async fn list_for_booker(&self, booker_id: BookerId) -> Result<Vec<Booking>, StoreError> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE booker_id = $1 ORDER BY created_at DESC"
        ))
        .bind(booker_id)
        .fetch_all(&self.pool)
        .await?;

        into_bookings(rows)
    }

    async fn list_stale_authorizations(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let rows: Vec<BookingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {BOOKING_COLUMNS} FROM bookings
            WHERE status IN ('pending', 'cancelled')
              AND payment_status = 'authorization_pending'
              AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_bookings(rows)
    }

    async fn update(&self, booking: &Booking) -> Result<Booking, StoreError> {
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            r#"
            UPDATE bookings SET
                status = $2,
                payment_status = $3,
                payment_intent_ref = $4,
                charge_ref = $5,
                payment_date = $6,
                class_completed_at = $7,
                funds_release_date = $8,
                funds_released = $9,
                funds_released_at = $10,
                cancelled_at = $11,
                cancellation_reason = $12,
                refund_amount = $13,
                updated_at = $14,
                version = version + 1
            WHERE id = $1 AND version = $15
            RETURNING {BOOKING_COLUMNS}
            "#
        ))
        .bind(booking.id)
        .bind(booking.status.as_str())
        .bind(booking.payment_status.as_str())
        .bind(&booking.payment_intent_ref)
        .bind(&booking.charge_ref)
        .bind(booking.payment_date)
        .bind(booking.class_completed_at)
        .bind(booking.funds_release_date)
        .bind(booking.funds_released)
        .bind(booking.funds_released_at)
        .bind(booking.cancelled_at)
        .bind(&booking.cancellation_reason)
        .bind(booking.refund_amount.map(Money::minor_units))
        .bind(booking.updated_at)
        .bind(booking.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Booking::try_from(row)?),
            None => {
                let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM bookings WHERE id = $1)")
                    .bind(booking.id)
                    .fetch_one(&self.pool)
                    .await?;
                if exists {
                    Err(StoreError::VersionConflict(booking.id))
                } else {
                    Err(StoreError::NotFound(booking.id))
                }
            }
        }
    }
}
