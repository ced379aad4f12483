//! Inbound payment gateway webhooks.
//!
//! Verification, deduplication and dispatch happen in that order. An event id
//! is recorded only after its dispatch succeeded (or was a definitive no-op),
//! so a transient failure makes the gateway redeliver and the event is
//! processed again.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::WebhookConfig;
use crate::error::{BookingError, StorageError};
use crate::models::{Booking, BookingId};
use crate::services::lifecycle::BookingLifecycleService;
use crate::services::payment::IntentStatus;

pub mod processed;
pub mod signature;

pub use processed::{MemoryProcessedEvents, ProcessedEvents, RedisProcessedEvents};
pub use signature::SignatureError;

/// Body the gateway POSTs for every payment state change.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    pub event_id: String,
    pub payment_id: String,
    /// The booking id we passed as `orderId` when creating the intent.
    #[serde(default)]
    pub order_id: Option<String>,
    pub status: IntentStatus,
    #[serde(default)]
    pub charge_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Unrecognized,
    /// Verified and recorded but nothing to do: unknown booking or a state
    /// that no longer accepts the event.
    Ignored,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook signature rejected: {0}")]
    SignatureInvalid(#[from] SignatureError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("webhook dispatch failed: {0}")]
    Dispatch(BookingError),
}

enum Action {
    Authorized,
    Failed,
    Refunded,
}

fn action_for(status: IntentStatus) -> Option<Action> {
    match status {
        s if s.is_successful() => Some(Action::Authorized),
        s if s.is_failed() => Some(Action::Failed),
        IntentStatus::Refunded => Some(Action::Refunded),
        _ => None,
    }
}

pub struct WebhookIngestor {
    lifecycle: Arc<BookingLifecycleService>,
    processed: Arc<dyn ProcessedEvents>,
    clock: Arc<dyn Clock>,
    secret: String,
    tolerance_secs: i64,
}

impl WebhookIngestor {
    pub fn new(
        lifecycle: Arc<BookingLifecycleService>,
        processed: Arc<dyn ProcessedEvents>,
        clock: Arc<dyn Clock>,
        config: &WebhookConfig,
    ) -> Self {
        Self {
            lifecycle,
            processed,
            clock,
            secret: config.secret.clone(),
            tolerance_secs: config.tolerance_secs,
        }
    }

    pub async fn ingest(&self, payload: &[u8], signature_header: &str) -> Result<WebhookOutcome, WebhookError> {
        if let Err(e) = signature::verify(payload, signature_header, &self.secret, self.clock.now(), self.tolerance_secs) {
            warn!(error = %e, "Rejected webhook with invalid signature");
            return Err(e.into());
        }

        let event: GatewayEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Verified webhook has an unreadable body");
                return Ok(WebhookOutcome::Unrecognized);
            }
        };

        if self.processed.contains(&event.event_id).await? {
            debug!(event_id = %event.event_id, "Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        let Some(action) = action_for(event.status) else {
            info!(event_id = %event.event_id, status = ?event.status, "Webhook status needs no action");
            return Ok(WebhookOutcome::Unrecognized);
        };

        let outcome = match self.dispatch(&event, action).await {
            Ok(Some(booking)) => {
                info!(
                    event_id = %event.event_id,
                    booking_id = %booking.id,
                    status = %booking.status,
                    payment_status = %booking.payment_status,
                    "Webhook processed"
                );
                WebhookOutcome::Processed
            }
            Ok(None) => {
                warn!(event_id = %event.event_id, payment_id = %event.payment_id, "Webhook for unknown booking");
                WebhookOutcome::Ignored
            }
            Err(e @ (BookingError::StateConflict { .. } | BookingError::BookingNotFound(_))) => {
                warn!(event_id = %event.event_id, error = %e, "Webhook does not apply to the booking state");
                WebhookOutcome::Ignored
            }
            Err(e) => {
                error!(event_id = %event.event_id, error = %e, "Webhook dispatch failed, awaiting redelivery");
                return Err(WebhookError::Dispatch(e));
            }
        };

        self.processed.record(&event.event_id).await?;
        Ok(outcome)
    }

    async fn resolve(&self, event: &GatewayEvent) -> Result<Option<BookingId>, BookingError> {
        if let Some(id) = event.order_id.as_deref().and_then(|raw| raw.parse::<BookingId>().ok()) {
            return Ok(Some(id));
        }
        Ok(self.lifecycle.find_by_intent(&event.payment_id).await?.map(|b| b.id))
    }

    async fn dispatch(&self, event: &GatewayEvent, action: Action) -> Result<Option<Booking>, BookingError> {
        let Some(booking_id) = self.resolve(event).await? else {
            return Ok(None);
        };

        let booking = match action {
            Action::Authorized => {
                self.lifecycle
                    .on_payment_authorized(booking_id, event.charge_id.clone())
                    .await?
            }
            Action::Failed => self.lifecycle.on_payment_failed(booking_id).await?,
            Action::Refunded => self.lifecycle.on_refund_issued(booking_id).await?,
        };
        Ok(Some(booking))
    }
}
