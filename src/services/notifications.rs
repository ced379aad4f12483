//! Outbound lifecycle notifications.
//!
//! Delivery is best effort and off the request path: the lifecycle service
//! hands events to a [`NotificationDispatcher`], whose worker task delivers
//! them in order and logs failures. A committed transition is never rolled
//! back because of a notification.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::models::{BookerId, Booking, BookingId, ClassId, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    BookingCreated,
    BookingCancelled,
    PaymentReceived,
    PayoutReleased,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub booking_id: BookingId,
    pub class_id: ClassId,
    pub booker_id: BookerId,
    pub participants: Vec<String>,
    pub session_start: DateTime<Utc>,
    pub total_amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Money>,
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn for_booking(kind: LifecycleEventKind, booking: &Booking, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            booking_id: booking.id,
            class_id: booking.class_id,
            booker_id: booking.booker_id,
            participants: booking.participants.iter().map(|p| p.name.clone()).collect(),
            session_start: booking.session_start,
            total_amount: booking.pricing.total_amount,
            refund_amount: booking.refund_amount,
            occurred_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification endpoint answered {0}")]
    Rejected(reqwest::StatusCode),
}

#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError>;
}

/// Writes events to the structured log. Default when no endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        info!(
            kind = ?event.kind,
            booking_id = %event.booking_id,
            booker_id = %event.booker_id,
            total = %event.total_amount,
            "Lifecycle notification"
        );
        Ok(())
    }
}

/// POSTs every event as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotificationSink {
    client: reqwest::Client,
    url: String,
}

impl HttpNotificationSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status()));
        }
        Ok(())
    }
}

/// Picks the HTTP sink when an endpoint is configured, the log sink otherwise.
pub fn sink_from_config(config: &NotificationConfig) -> Result<Arc<dyn NotificationSink>, NotifyError> {
    match &config.url {
        Some(url) => Ok(Arc::new(HttpNotificationSink::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(LogNotificationSink)),
    }
}

/// Queue in front of a [`NotificationSink`]. Must be created inside a tokio
/// runtime; the worker stops when the last dispatcher is dropped.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl NotificationDispatcher {
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.notify(&event).await {
                    warn!(booking_id = %event.booking_id, kind = ?event.kind, error = %e, "Notification delivery failed");
                }
            }
        });
        Self { tx }
    }

    pub fn dispatch(&self, event: LifecycleEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            warn!(booking_id = %event.booking_id, kind = ?event.kind, "Notification worker stopped, event dropped");
        }
    }
}

/// Keeps every event in memory; handy for assertions in tests.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotificationSink {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().await.clone()
    }

    pub async fn kinds(&self) -> Vec<LifecycleEventKind> {
        self.events.lock().await.iter().map(|e| e.kind).collect()
    }

    /// Kinds recorded so far, waiting up to a second for at least `count`.
    pub async fn wait_for(&self, count: usize) -> Vec<LifecycleEventKind> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let kinds = self.kinds().await;
            if kinds.len() >= count || tokio::time::Instant::now() >= deadline {
                return kinds;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Participant, Pricing};
    use tokio::sync::Semaphore;

    /// Each delivery waits for one permit, then records the event.
    struct GatedSink {
        gate: Arc<Semaphore>,
        inner: RecordingNotificationSink,
    }

    #[async_trait]
    impl NotificationSink for GatedSink {
        async fn notify(&self, event: &LifecycleEvent) -> Result<(), NotifyError> {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.inner.notify(event).await
        }
    }

    fn event(kind: LifecycleEventKind) -> LifecycleEvent {
        let booking = Booking {
            id: BookingId::new(),
            class_id: ClassId::new(),
            booker_id: BookerId::new(),
            participants: vec![Participant { name: "Ada".to_string(), age: 9 }],
            session_start: Utc::now(),
            special_requests: None,
            pricing: Pricing::with_service_fee(Money::from_minor(2000), Money::from_minor(250)),
            status: crate::models::BookingStatus::Pending,
            payment_status: crate::models::PaymentStatus::Unpaid,
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 0,
        };
        LifecycleEvent::for_booking(kind, &booking, Utc::now())
    }

    #[tokio::test]
    async fn dispatch_does_not_wait_for_a_stalled_sink() {
        let gate = Arc::new(Semaphore::new(0));
        let recorded = RecordingNotificationSink::new();
        let dispatcher = NotificationDispatcher::spawn(Arc::new(GatedSink { gate: gate.clone(), inner: recorded.clone() }));

        dispatcher.dispatch(event(LifecycleEventKind::BookingCreated));
        dispatcher.dispatch(event(LifecycleEventKind::PaymentReceived));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(recorded.kinds().await.is_empty());

        gate.add_permits(2);

        assert_eq!(
            recorded.wait_for(2).await,
            vec![LifecycleEventKind::BookingCreated, LifecycleEventKind::PaymentReceived]
        );
    }
}
