//! The booking state machine as a single table.
//!
//! Every mutation of `(status, payment_status)` in the lifecycle service goes
//! through [`Transition::target`]; a `None` there is a state conflict.

use crate::error::{BookingError, BookingState};
use crate::models::{Booking, BookingStatus, PaymentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginPayment,
    AuthorizePayment,
    FailPayment,
    RecordRefund,
    /// Payment completed after the booking was cancelled; the full amount
    /// goes straight back.
    RefundLateAuthorization,
    /// `refunded` is true when money went back to the booker as part of the
    /// cancellation.
    Cancel { refunded: bool },
    CompleteClass,
    MarkNoShow,
    ReleaseFunds,
}

impl Transition {
    /// Human readable precondition, used in conflict errors.
    pub fn expected(self) -> &'static str {
        match self {
            Transition::BeginPayment => "pending/unpaid",
            Transition::AuthorizePayment => "pending/authorization_pending",
            Transition::FailPayment => "pending or cancelled/authorization_pending",
            Transition::RecordRefund => "payment held or paid",
            Transition::RefundLateAuthorization => "cancelled/authorization_pending",
            Transition::Cancel { .. } => "pending or confirmed",
            Transition::CompleteClass | Transition::MarkNoShow => "confirmed/held",
            Transition::ReleaseFunds => "completed or no_show with held funds",
        }
    }

    pub fn target(self, from: BookingState) -> Option<BookingState> {
        use BookingStatus::*;
        use PaymentStatus::*;

        let (status, payment_status) = match (self, from.status, from.payment_status) {
            (Transition::BeginPayment, Pending, Unpaid) => (Pending, AuthorizationPending),
            (Transition::AuthorizePayment, Pending, Unpaid | AuthorizationPending) => (Confirmed, Held),
            (Transition::FailPayment, Pending, Unpaid | AuthorizationPending) => (Pending, Failed),
            (Transition::FailPayment, Cancelled, AuthorizationPending) => (Cancelled, Failed),
            (Transition::RefundLateAuthorization, Cancelled, AuthorizationPending) => (Cancelled, Refunded),
            (Transition::RecordRefund, status, Held | Paid) => (status, Refunded),
            (Transition::Cancel { refunded }, Pending | Confirmed, payment) => {
                (Cancelled, if refunded { Refunded } else { payment })
            }
            (Transition::CompleteClass, Confirmed, Held) => (Completed, Held),
            (Transition::MarkNoShow, Confirmed, Held) => (NoShow, Held),
            (Transition::ReleaseFunds, Completed | NoShow, Held) => (from.status, Paid),
            _ => return None,
        };
        Some(BookingState { status, payment_status })
    }

    /// Check the guard against `booking` without changing it.
    pub fn check(self, booking: &Booking) -> Result<BookingState, BookingError> {
        let from = state_of(booking);
        self.target(from).ok_or(BookingError::StateConflict {
            booking_id: booking.id,
            current: from,
            expected: self.expected(),
        })
    }

    /// Move `booking` to the target state or fail with a state conflict.
    pub fn apply(self, booking: &mut Booking) -> Result<(), BookingError> {
        let to = self.check(booking)?;
        booking.status = to.status;
        booking.payment_status = to.payment_status;
        Ok(())
    }
}

pub fn state_of(booking: &Booking) -> BookingState {
    BookingState { status: booking.status, payment_status: booking.payment_status }
}
