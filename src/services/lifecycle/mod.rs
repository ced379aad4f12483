//! Booking lifecycle: admission, payment, cancellation, completion, payout.
//!
//! This service is the only writer of [`Booking`] records. All state changes
//! go through the transition table in [`transitions`] and are persisted with
//! a compare-and-set on `version`; a lost race re-reads the record and
//! re-applies the change up to `max_update_attempts` times.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::BookingPolicy;
use crate::error::{BookingError, BookingResult, StorageError};
use crate::models::{
    BookerId, Booking, BookingId, BookingStatus, ClassId, Money, Participant, PaymentStatus, Pricing,
};
use crate::services::calendar::add_working_days;
use crate::services::catalog::ClassCatalog;
use crate::services::ledger::{CapacityLedger, CapacitySnapshot};
use crate::services::notifications::{LifecycleEvent, LifecycleEventKind, NotificationDispatcher, NotificationSink};
use crate::services::payment::{IntentRequest, PaymentGateway, PayoutTrigger};
use crate::services::release::{FundsReleaseScheduler, ReleaseExecutor};
use crate::services::store::{BookingStore, StoreError};

pub mod refund;
pub mod transitions;

pub use refund::{RefundQuote, RefundSchedule};
pub use transitions::Transition;

/// Input of [`BookingLifecycleService::create_booking`].
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub class_id: ClassId,
    pub booker_id: BookerId,
    pub participants: Vec<Participant>,
    /// Must match the catalog's start for the class; the stored booking
    /// always carries the catalog value.
    pub session_start: DateTime<Utc>,
    pub special_requests: Option<String>,
}

/// What the client needs to complete a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentHandle {
    pub booking_id: BookingId,
    pub intent_ref: String,
    /// Only present when the intent was created by this call.
    pub payment_url: Option<String>,
    pub amount: Money,
    pub currency: String,
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cancellation {
    pub booking: Booking,
    pub refund_percent: u8,
    pub refund_amount: Money,
}

/// Collaborators of the lifecycle service.
pub struct LifecycleComponents {
    pub catalog: Arc<dyn ClassCatalog>,
    pub ledger: Arc<dyn CapacityLedger>,
    pub store: Arc<dyn BookingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub payouts: Arc<dyn PayoutTrigger>,
    pub notifier: Arc<dyn NotificationSink>,
    pub releases: Arc<FundsReleaseScheduler>,
    pub clock: Arc<dyn Clock>,
}

enum Change {
    Write,
    Keep,
}

pub struct BookingLifecycleService {
    catalog: Arc<dyn ClassCatalog>,
    ledger: Arc<dyn CapacityLedger>,
    store: Arc<dyn BookingStore>,
    gateway: Arc<dyn PaymentGateway>,
    payouts: Arc<dyn PayoutTrigger>,
    notifications: NotificationDispatcher,
    releases: Arc<FundsReleaseScheduler>,
    clock: Arc<dyn Clock>,
    policy: BookingPolicy,
    refunds: RefundSchedule,
    currency: String,
}

impl BookingLifecycleService {
    /// Spawns the notification worker, so call it inside a tokio runtime.
    pub fn new(components: LifecycleComponents, policy: BookingPolicy, currency: impl Into<String>) -> Self {
        let refunds = RefundSchedule::from_policy(&policy);
        Self {
            catalog: components.catalog,
            ledger: components.ledger,
            store: components.store,
            gateway: components.gateway,
            payouts: components.payouts,
            notifications: NotificationDispatcher::spawn(components.notifier),
            releases: components.releases,
            clock: components.clock,
            policy,
            refunds,
            currency: currency.into(),
        }
    }

    pub fn releases(&self) -> &Arc<FundsReleaseScheduler> {
        &self.releases
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    // ---- queries ----

    pub async fn get(&self, booking_id: BookingId) -> BookingResult<Booking> {
        Ok(self.store.get(booking_id).await?)
    }

    pub async fn list_for_booker(&self, booker_id: BookerId) -> BookingResult<Vec<Booking>> {
        Ok(self.store.list_for_booker(booker_id).await?)
    }

    pub async fn find_by_intent(&self, intent_ref: &str) -> BookingResult<Option<Booking>> {
        Ok(self.store.find_by_intent(intent_ref).await?)
    }

    pub async fn capacity(&self, class_id: ClassId) -> BookingResult<CapacitySnapshot> {
        Ok(self.ledger.snapshot(class_id).await?)
    }

    /// Bookings stuck waiting on the gateway since before `older_than`.
    pub async fn stale_authorizations(&self, older_than: DateTime<Utc>, limit: i64) -> BookingResult<Vec<Booking>> {
        Ok(self.store.list_stale_authorizations(older_than, limit).await?)
    }

    // ---- commands ----

    pub async fn create_booking(&self, request: NewBooking) -> BookingResult<Booking> {
        let now = self.clock.now();
        validate_participants(&request.participants)?;

        let session = self
            .catalog
            .session(request.class_id)
            .await?
            .ok_or(BookingError::ClassNotFound(request.class_id))?;
        validate_session_start(request.session_start, session.session_start, now)?;

        // Fast path only; the exclusive insert below is what enforces it.
        if !self.policy.allow_repeat_bookings {
            if let Some(existing) = self.store.find_active(request.booker_id, request.class_id).await? {
                return Err(BookingError::DuplicateBooking { existing: existing.id });
            }
        }

        let seats = request.participants.len() as u32;
        let admission = self.ledger.try_admit(request.class_id, seats).await?;
        if !admission.admitted {
            info!(
                class_id = %request.class_id,
                booked = admission.booked,
                max_capacity = admission.max_capacity,
                requested = seats,
                "Booking refused, class is full"
            );
            return Err(BookingError::CapacityExceeded(request.class_id));
        }

        let booking = Booking {
            id: BookingId::new(),
            class_id: request.class_id,
            booker_id: request.booker_id,
            participants: request.participants,
            session_start: session.session_start,
            special_requests: request.special_requests,
            pricing: Pricing::with_service_fee(session.base_price, self.policy.service_fee()),
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            payment_intent_ref: None,
            charge_ref: None,
            payment_date: None,
            class_completed_at: None,
            funds_release_date: None,
            funds_released: false,
            funds_released_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            refund_amount: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let inserted = if self.policy.allow_repeat_bookings {
            self.store.insert(&booking).await
        } else {
            self.store.insert_exclusive(&booking).await
        };
        if let Err(e) = inserted {
            match &e {
                StoreError::ActiveExists(existing) => info!(
                    booker_id = %booking.booker_id,
                    class_id = %booking.class_id,
                    existing = %existing,
                    "Concurrent duplicate booking refused, releasing seats"
                ),
                _ => error!(class_id = %booking.class_id, error = %e, "Failed to persist booking, releasing seats"),
            }
            self.release_seats(&booking).await;
            return Err(e.into());
        }

        info!(
            booking_id = %booking.id,
            class_id = %booking.class_id,
            participants = seats,
            total = %booking.pricing.total_amount,
            "Booking created"
        );
        self.notify(LifecycleEventKind::BookingCreated, &booking);
        Ok(booking)
    }

    pub async fn begin_payment(&self, booking_id: BookingId) -> BookingResult<PaymentHandle> {
        let booking = self.store.get(booking_id).await?;
        if let Some(intent_ref) = &booking.payment_intent_ref {
            return Ok(self.existing_handle(&booking, intent_ref));
        }
        Transition::BeginPayment.check(&booking)?;

        let intent = self
            .gateway
            .create_intent(IntentRequest {
                booking_id,
                amount: booking.pricing.total_amount,
                currency: self.currency.clone(),
                description: format!("Class booking for {} participant(s)", booking.participant_count()),
            })
            .await?;

        let intent_ref = intent.intent_ref.clone();
        let (stored, written) = self
            .mutate(booking_id, |b, _| {
                if b.payment_intent_ref.is_some() {
                    return Ok(Change::Keep);
                }
                Transition::BeginPayment.apply(b)?;
                b.payment_intent_ref = Some(intent_ref.clone());
                Ok(Change::Write)
            })
            .await?;

        match (&stored.payment_intent_ref, written) {
            (Some(existing), false) => {
                warn!(
                    booking_id = %booking_id,
                    discarded = %intent.intent_ref,
                    "Payment started concurrently, returning the stored intent"
                );
                Ok(self.existing_handle(&stored, existing))
            }
            _ => {
                info!(booking_id = %booking_id, intent_ref = %intent.intent_ref, "Payment intent created");
                Ok(PaymentHandle {
                    booking_id,
                    intent_ref: intent.intent_ref,
                    payment_url: intent.payment_url,
                    amount: stored.pricing.total_amount,
                    currency: self.currency.clone(),
                    reused: false,
                })
            }
        }
    }

    /// A booking cancelled while its intent was still open gets the whole
    /// amount refunded instead of being confirmed.
    pub async fn on_payment_authorized(&self, booking_id: BookingId, charge_ref: Option<String>) -> BookingResult<Booking> {
        let current = self.store.get(booking_id).await?;
        if current.cancelled_with_open_intent() {
            return self.refund_late_authorization(current, charge_ref).await;
        }

        let result = self
            .mutate(booking_id, |b, now| {
                if matches!(b.payment_status, PaymentStatus::Held | PaymentStatus::Paid | PaymentStatus::Refunded) {
                    return Ok(Change::Keep);
                }
                Transition::AuthorizePayment.apply(b)?;
                b.charge_ref = charge_ref.clone().or_else(|| b.payment_intent_ref.clone());
                b.payment_date = Some(now);
                Ok(Change::Write)
            })
            .await;

        let (booking, written) = match result {
            Err(e @ BookingError::StateConflict { .. }) => {
                // cancelled between the read above and the write
                let latest = self.store.get(booking_id).await?;
                if latest.cancelled_with_open_intent() {
                    return self.refund_late_authorization(latest, charge_ref).await;
                }
                return Err(e);
            }
            other => other?,
        };

        if written {
            info!(booking_id = %booking_id, total = %booking.pricing.total_amount, "Payment authorized, funds held");
            self.notify(LifecycleEventKind::PaymentReceived, &booking);
        } else {
            info!(booking_id = %booking_id, payment_status = %booking.payment_status, "Payment already recorded");
        }
        Ok(booking)
    }

    pub async fn on_payment_failed(&self, booking_id: BookingId) -> BookingResult<Booking> {
        let mut seats_held = false;
        let (booking, written) = self
            .mutate(booking_id, |b, _| {
                if b.payment_status == PaymentStatus::Failed {
                    return Ok(Change::Keep);
                }
                seats_held = b.holds_capacity();
                Transition::FailPayment.apply(b)?;
                Ok(Change::Write)
            })
            .await?;

        if written && seats_held {
            warn!(booking_id = %booking_id, "Payment failed, releasing seats");
            self.release_seats(&booking).await;
        } else if written {
            info!(booking_id = %booking_id, "Payment of a cancelled booking failed, nothing to refund");
        } else {
            debug!(booking_id = %booking_id, "Payment failure already recorded");
        }
        Ok(booking)
    }

    pub async fn on_refund_issued(&self, booking_id: BookingId) -> BookingResult<Booking> {
        let (booking, written) = self
            .mutate(booking_id, |b, _| {
                if b.payment_status == PaymentStatus::Refunded {
                    return Ok(Change::Keep);
                }
                Transition::RecordRefund.apply(b)?;
                Ok(Change::Write)
            })
            .await?;

        if written {
            info!(booking_id = %booking_id, "Refund recorded");
        }
        Ok(booking)
    }

    pub async fn cancel(&self, booking_id: BookingId, reason: Option<String>) -> BookingResult<Cancellation> {
        let booking = self.store.get(booking_id).await?;
        Transition::Cancel { refunded: false }.check(&booking)?;

        let quote = self.refunds.quote(booking.pricing.total_amount, booking.session_start - self.clock.now());
        let captured = booking.payment_status.funds_captured();
        let refund_amount = if captured { quote.amount } else { Money::ZERO };

        let refunded = if refund_amount.is_positive() {
            let charge = booking
                .charge_ref
                .as_deref()
                .or(booking.payment_intent_ref.as_deref())
                .ok_or_else(|| StorageError::Corrupt(format!("booking {booking_id} holds funds without a charge")))?;
            let refund_ref = self
                .gateway
                .refund(
                    charge,
                    refund_amount,
                    reason.as_deref().unwrap_or("cancelled by booker"),
                    &format!("refund-{booking_id}"),
                )
                .await?;
            info!(
                booking_id = %booking_id,
                refund_ref = %refund_ref,
                amount = %refund_amount,
                percent = quote.percent,
                "Refund issued"
            );
            true
        } else {
            false
        };

        let mut seats_held = false;
        let (cancelled, _) = self
            .mutate(booking_id, |b, now| {
                let payment_moved = if refunded {
                    !matches!(b.payment_status, PaymentStatus::Held | PaymentStatus::Paid | PaymentStatus::Refunded)
                } else {
                    b.payment_status != booking.payment_status
                };
                if payment_moved {
                    return Err(BookingError::ConcurrentModification(booking_id));
                }
                seats_held = b.holds_capacity();
                Transition::Cancel { refunded }.apply(b)?;
                b.cancelled_at = Some(now);
                b.cancellation_reason = reason.clone();
                b.refund_amount = Some(refund_amount);
                Ok(Change::Write)
            })
            .await?;

        if seats_held {
            self.release_seats(&cancelled).await;
        }

        info!(booking_id = %booking_id, refund = %refund_amount, "Booking cancelled");
        if cancelled.payment_status.funds_captured() {
            let note = format!("cancelled {}% refund window with funds held", quote.percent);
            if let Err(e) = self.releases.flag_for_reconciliation(booking_id, &note).await {
                error!(booking_id = %booking_id, needs_reconciliation = true, error = %e, "Failed to flag held funds");
            }
        } else if cancelled.cancelled_with_open_intent() {
            warn!(
                booking_id = %booking_id,
                intent_ref = ?cancelled.payment_intent_ref,
                "Cancelled with an open payment intent, a late authorization will be refunded"
            );
        }
        self.notify(LifecycleEventKind::BookingCancelled, &cancelled);
        Ok(Cancellation { booking: cancelled, refund_percent: quote.percent, refund_amount })
    }

    pub async fn mark_class_completed(&self, booking_id: BookingId) -> BookingResult<Booking> {
        self.close_out(booking_id, Transition::CompleteClass).await
    }

    pub async fn mark_no_show(&self, booking_id: BookingId) -> BookingResult<Booking> {
        self.close_out(booking_id, Transition::MarkNoShow).await
    }

    /// Shared by completion and no-show: both keep the funds held and hand
    /// them to the provider after the business-day hold.
    async fn close_out(&self, booking_id: BookingId, transition: Transition) -> BookingResult<Booking> {
        let booking = self.store.get(booking_id).await?;
        transition.check(&booking)?;

        let completed_at = self.clock.now();
        let release_at = add_working_days(completed_at, self.policy.hold_working_days);
        // Schedule first: if the status write below fails, the entry fires
        // later, hits a state conflict and is closed.
        self.releases.schedule(booking_id, release_at).await?;

        let (booking, _) = self
            .mutate(booking_id, |b, _| {
                transition.apply(b)?;
                b.class_completed_at = Some(completed_at);
                b.funds_release_date = Some(release_at);
                Ok(Change::Write)
            })
            .await?;

        info!(
            booking_id = %booking_id,
            status = %booking.status,
            release_at = %release_at,
            "Class closed out, funds held until release date"
        );
        Ok(booking)
    }

    pub async fn finalize_release(&self, booking_id: BookingId) -> BookingResult<Booking> {
        let booking = self.store.get(booking_id).await?;
        if booking.funds_released {
            return Err(BookingError::StateConflict {
                booking_id,
                current: transitions::state_of(&booking),
                expected: Transition::ReleaseFunds.expected(),
            });
        }
        Transition::ReleaseFunds.check(&booking)?;

        let payout_ref = self.payouts.release_to_provider(&booking).await?;

        let (booking, written) = self
            .mutate(booking_id, |b, now| {
                if b.funds_released {
                    return Ok(Change::Keep);
                }
                Transition::ReleaseFunds.apply(b)?;
                b.funds_released = true;
                b.funds_released_at = Some(now);
                Ok(Change::Write)
            })
            .await?;

        if written {
            info!(
                booking_id = %booking_id,
                payout_ref = %payout_ref,
                amount = %booking.pricing.base_price,
                "Funds released to provider"
            );
            self.notify(LifecycleEventKind::PayoutReleased, &booking);
        }
        Ok(booking)
    }

    // ---- helpers ----

    async fn refund_late_authorization(&self, booking: Booking, charge_ref: Option<String>) -> BookingResult<Booking> {
        let booking_id = booking.id;
        Transition::RefundLateAuthorization.check(&booking)?;

        let charge = charge_ref
            .clone()
            .or_else(|| booking.payment_intent_ref.clone())
            .ok_or_else(|| StorageError::Corrupt(format!("booking {booking_id} has an intent state without an intent")))?;
        let amount = booking.pricing.total_amount;

        let refund_ref = match self
            .gateway
            .refund(&charge, amount, "booking cancelled before payment completed", &format!("refund-{booking_id}"))
            .await
        {
            Ok(refund_ref) => refund_ref,
            Err(e) => {
                error!(
                    booking_id = %booking_id,
                    needs_reconciliation = true,
                    amount = %amount,
                    error = %e,
                    "Late authorization of a cancelled booking could not be refunded"
                );
                return Err(e.into());
            }
        };

        let (refunded, _) = self
            .mutate(booking_id, |b, now| {
                if b.payment_status == PaymentStatus::Refunded {
                    return Ok(Change::Keep);
                }
                Transition::RefundLateAuthorization.apply(b)?;
                b.charge_ref = Some(charge.clone());
                b.payment_date = Some(now);
                b.refund_amount = Some(amount);
                Ok(Change::Write)
            })
            .await?;

        warn!(
            booking_id = %booking_id,
            refund_ref = %refund_ref,
            amount = %amount,
            "Payment authorized after cancellation, refunded in full"
        );
        Ok(refunded)
    }

    /// Load, change, compare-and-set. Returns the stored booking and whether
    /// a write happened.
    async fn mutate<F>(&self, booking_id: BookingId, mut change: F) -> BookingResult<(Booking, bool)>
    where
        F: FnMut(&mut Booking, DateTime<Utc>) -> BookingResult<Change> + Send,
    {
        let attempts = self.policy.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let mut booking = self.store.get(booking_id).await?;
            let now = self.clock.now();
            if let Change::Keep = change(&mut booking, now)? {
                return Ok((booking, false));
            }
            booking.updated_at = now;
            match self.store.update(&booking).await {
                Ok(stored) => return Ok((stored, true)),
                Err(StoreError::VersionConflict(_)) if attempt < attempts => {
                    debug!(booking_id = %booking_id, attempt, "Version conflict, re-reading booking");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(BookingError::ConcurrentModification(booking_id))
    }

    fn existing_handle(&self, booking: &Booking, intent_ref: &str) -> PaymentHandle {
        PaymentHandle {
            booking_id: booking.id,
            intent_ref: intent_ref.to_string(),
            payment_url: None,
            amount: booking.pricing.total_amount,
            currency: self.currency.clone(),
            reused: true,
        }
    }

    async fn release_seats(&self, booking: &Booking) {
        if let Err(e) = self.ledger.release(booking.class_id, booking.participant_count()).await {
            error!(
                booking_id = %booking.id,
                class_id = %booking.class_id,
                seats = booking.participant_count(),
                error = %e,
                "Failed to release seats, capacity needs reconciliation"
            );
        }
    }

    fn notify(&self, kind: LifecycleEventKind, booking: &Booking) {
        self.notifications
            .dispatch(LifecycleEvent::for_booking(kind, booking, self.clock.now()));
    }
}

#[async_trait]
impl ReleaseExecutor for BookingLifecycleService {
    async fn finalize_release(&self, booking_id: BookingId) -> Result<Booking, BookingError> {
        BookingLifecycleService::finalize_release(self, booking_id).await
    }
}

fn validate_participants(participants: &[Participant]) -> BookingResult<()> {
    if participants.is_empty() {
        return Err(BookingError::Validation("at least one participant is required".to_string()));
    }
    if let Some(p) = participants.iter().find(|p| p.name.trim().is_empty()) {
        return Err(BookingError::Validation(format!("participant name must not be blank (age {})", p.age)));
    }
    Ok(())
}

/// `requested` is what the client saw; `scheduled` comes from the catalog.
fn validate_session_start(
    requested: DateTime<Utc>,
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
) -> BookingResult<()> {
    if requested != scheduled {
        return Err(BookingError::Validation(format!(
            "session start {requested} does not match the class schedule ({scheduled})"
        )));
    }
    if scheduled <= now {
        return Err(BookingError::Validation("session start must be in the future".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn kid(name: &str) -> Participant {
        Participant { name: name.to_string(), age: 8 }
    }

    #[test]
    fn rejects_sessions_in_the_past() {
        let now = Utc::now();
        let started = now - Duration::minutes(1);
        let err = validate_session_start(started, started, now).unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));
    }

    #[test]
    fn rejects_a_start_the_catalog_does_not_know() {
        let now = Utc::now();
        let scheduled = now + Duration::hours(1);
        let err = validate_session_start(now + Duration::days(365), scheduled, now).unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));
        assert!(validate_session_start(scheduled, scheduled, now).is_ok());
    }

    #[test]
    fn rejects_empty_and_blank_participants() {
        assert!(validate_participants(&[]).is_err());
        assert!(validate_participants(&[kid("  ")]).is_err());
        assert!(validate_participants(&[kid("Ada"), kid("Linus")]).is_ok());
    }
}
