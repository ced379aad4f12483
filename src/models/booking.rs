use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{BookerId, BookingId, ClassId, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    AuthorizationPending,
    Held,
    Paid,
    Failed,
    Refunded,
}

/// Returned when a persisted status string does not name a known state.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownState {
    pub kind: &'static str,
    pub value: String,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
        }
    }

    /// No transition leaves these states.
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed | BookingStatus::NoShow)
    }
}

impl FromStr for BookingStatus {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            "no_show" => Ok(BookingStatus::NoShow),
            other => Err(UnknownState { kind: "booking status", value: other.to_string() }),
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::AuthorizationPending => "authorization_pending",
            PaymentStatus::Held => "held",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Money has been captured and not yet returned to the booker.
    pub fn funds_captured(self) -> bool {
        matches!(self, PaymentStatus::Held | PaymentStatus::Paid)
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "authorization_pending" => Ok(PaymentStatus::AuthorizationPending),
            "held" => Ok(PaymentStatus::Held),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(UnknownState { kind: "payment status", value: other.to_string() }),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub age: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    pub base_price: Money,
    pub service_fee: Money,
    pub total_amount: Money,
}

impl Pricing {
    /// Fixed per-booking fee on top of the class price.
    pub fn with_service_fee(base_price: Money, service_fee: Money) -> Self {
        Self { base_price, service_fee, total_amount: base_price + service_fee }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub class_id: ClassId,
    pub booker_id: BookerId,
    pub participants: Vec<Participant>,
    pub session_start: DateTime<Utc>,
    pub special_requests: Option<String>,
    pub pricing: Pricing,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub payment_intent_ref: Option<String>,
    pub charge_ref: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub class_completed_at: Option<DateTime<Utc>>,
    pub funds_release_date: Option<DateTime<Utc>>,
    pub funds_released: bool,
    pub funds_released_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub refund_amount: Option<Money>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped by every store update.
    pub version: i64,
}

impl Booking {
    pub fn participant_count(&self) -> u32 {
        self.participants.len() as u32
    }

    /// Whether this booking still occupies seats in the capacity ledger.
    /// Failed payments and cancellations have already handed them back.
    pub fn holds_capacity(&self) -> bool {
        matches!(self.status, BookingStatus::Pending | BookingStatus::Confirmed)
            && self.payment_status != PaymentStatus::Failed
    }

    /// Cancelled while the gateway still had a live intent for it.
    pub fn cancelled_with_open_intent(&self) -> bool {
        self.status == BookingStatus::Cancelled && self.payment_status == PaymentStatus::AuthorizationPending
    }

    /// Counts against the one-booking-per-class rule.
    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled && self.payment_status != PaymentStatus::Failed
    }
}
