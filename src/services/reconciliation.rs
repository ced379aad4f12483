use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::ReconciliationConfig;
use crate::error::BookingResult;
use crate::models::{Booking, BookingStatus};
use crate::services::lifecycle::BookingLifecycleService;

/// Re-queries the gateway for bookings whose authorization webhook never
/// arrived and applies whatever the gateway reports. Cancelled bookings with
/// an open intent are included so a payment that completed after the
/// cancellation still gets refunded.
pub struct PaymentReconciler {
    lifecycle: Arc<BookingLifecycleService>,
    clock: Arc<dyn Clock>,
    config: ReconciliationConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationStats {
    pub checked: u32,
    pub authorized: u32,
    /// Authorized after cancellation and refunded in full.
    pub refunded: u32,
    pub failed: u32,
    pub still_pending: u32,
    pub errors: u32,
}

enum Resolution {
    Authorized,
    Refunded,
    Failed,
    Pending,
}

impl PaymentReconciler {
    pub fn new(lifecycle: Arc<BookingLifecycleService>, clock: Arc<dyn Clock>, config: ReconciliationConfig) -> Self {
        Self { lifecycle, clock, config }
    }

    pub async fn run_once(&self) -> BookingResult<ReconciliationStats> {
        let older_than = self.clock.now() - Duration::minutes(self.config.stale_after_minutes);
        let stale = self.lifecycle.stale_authorizations(older_than, self.config.batch_size).await?;

        let mut stats = ReconciliationStats::default();
        if stale.is_empty() {
            info!("💳 No stale payment authorizations");
            return Ok(stats);
        }

        info!("💳 Found {} stale payment authorizations to reconcile", stale.len());

        for booking in stale {
            stats.checked += 1;
            match self.reconcile(&booking).await {
                Ok(Resolution::Authorized) => stats.authorized += 1,
                Ok(Resolution::Refunded) => stats.refunded += 1,
                Ok(Resolution::Failed) => stats.failed += 1,
                Ok(Resolution::Pending) => stats.still_pending += 1,
                Err(e) => {
                    stats.errors += 1;
                    error!(booking_id = %booking.id, error = %e, "Failed to reconcile payment");
                }
            }
        }

        info!(
            checked = stats.checked,
            authorized = stats.authorized,
            refunded = stats.refunded,
            failed = stats.failed,
            still_pending = stats.still_pending,
            errors = stats.errors,
            "✅ Payment reconciliation finished"
        );
        Ok(stats)
    }

    async fn reconcile(&self, booking: &Booking) -> BookingResult<Resolution> {
        let Some(intent_ref) = booking.payment_intent_ref.as_deref() else {
            warn!(booking_id = %booking.id, "Booking awaits authorization without an intent");
            return Ok(Resolution::Pending);
        };

        let details = self.lifecycle.gateway().retrieve_intent(intent_ref).await?;
        if details.status.is_successful() {
            let settled = self.lifecycle.on_payment_authorized(booking.id, details.charge_ref).await?;
            if settled.status == BookingStatus::Cancelled {
                Ok(Resolution::Refunded)
            } else {
                Ok(Resolution::Authorized)
            }
        } else if details.status.is_failed() {
            self.lifecycle.on_payment_failed(booking.id).await?;
            Ok(Resolution::Failed)
        } else {
            Ok(Resolution::Pending)
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(self.config.interval_secs)).await;
                if let Err(e) = self.run_once().await {
                    error!("Payment reconciliation failed: {}", e);
                }
            }
        })
    }
}
