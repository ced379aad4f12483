use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{ClassId, Money};

/// Read model of a bookable class session, supplied by the listings subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: ClassId,
    pub max_capacity: u32,
    pub current_booked_count: u32,
    pub session_start: DateTime<Utc>,
    pub base_price: Money,
}

#[derive(Debug, FromRow)]
pub(crate) struct ClassSessionRow {
    pub id: ClassId,
    pub max_capacity: i32,
    pub current_booked_count: i32,
    pub session_start: DateTime<Utc>,
    pub base_price: i64,
}

impl From<ClassSessionRow> for ClassSession {
    fn from(row: ClassSessionRow) -> Self {
        Self {
            id: row.id,
            max_capacity: row.max_capacity.max(0) as u32,
            current_booked_count: row.current_booked_count.max(0) as u32,
            session_start: row.session_start,
            base_price: Money::from_minor(row.base_price),
        }
    }
}
