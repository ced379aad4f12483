#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use fake::faker::name::en::FirstName;
use fake::Fake;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use class_booking::clock::ManualClock;
use class_booking::config::Config;
use class_booking::error::BookingResult;
use class_booking::models::{BookerId, Booking, BookingId, ClassId, ClassSession, Money, Participant};
use class_booking::services::catalog::MemoryClassCatalog;
use class_booking::services::ledger::MemoryCapacityLedger;
use class_booking::services::lifecycle::{BookingLifecycleService, NewBooking};
use class_booking::services::notifications::RecordingNotificationSink;
use class_booking::services::payment::{
    GatewayError, IntentDetails, IntentRequest, IntentStatus, PaymentGateway, PaymentIntent, PayoutTrigger,
};
use class_booking::services::release::{MemoryReleaseSchedule, ReleaseEntry};
use class_booking::services::store::{BookingStore, MemoryBookingStore, StoreError};
use class_booking::services::webhook::{signature, MemoryProcessedEvents};
use class_booking::{AppState, Backends};

pub const WEBHOOK_SECRET: &str = "whsec_integration";

/// Friday 2026-10-16 10:00 UTC.
pub fn friday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 10, 0, 0).unwrap()
}

pub fn test_config() -> Config {
    serde_json::from_value(serde_json::json!({
        "database": { "url": "postgres://unused" },
        "redis": { "url": "redis://unused" },
        "payment": { "merchant_id": "team", "merchant_password": "secret" },
        "webhook": { "secret": WEBHOOK_SECRET },
        "release": { "backoff_base_secs": 60, "max_attempts": 3 }
    }))
    .expect("test config")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundCall {
    pub charge_ref: String,
    pub amount: Money,
    pub idempotency_key: String,
}

/// Gateway double with scriptable failures. Payouts are idempotent per
/// booking id like the real provider API.
#[derive(Default)]
pub struct FakeGateway {
    intents_created: AtomicUsize,
    fail_next_create: Mutex<Option<GatewayError>>,
    intent_statuses: Mutex<HashMap<String, IntentStatus>>,
    refunds: Mutex<Vec<RefundCall>>,
    failing_payouts: AtomicU32,
    payout_calls: AtomicUsize,
    paid_out: Mutex<HashSet<BookingId>>,
}

impl FakeGateway {
    pub fn intents_created(&self) -> usize {
        self.intents_created.load(Ordering::SeqCst)
    }

    pub async fn fail_next_create(&self, error: GatewayError) {
        *self.fail_next_create.lock().await = Some(error);
    }

    pub async fn set_intent_status(&self, intent_ref: &str, status: IntentStatus) {
        self.intent_statuses.lock().await.insert(intent_ref.to_string(), status);
    }

    pub async fn refunds(&self) -> Vec<RefundCall> {
        self.refunds.lock().await.clone()
    }

    pub fn fail_payouts(&self, times: u32) {
        self.failing_payouts.store(times, Ordering::SeqCst);
    }

    pub fn payout_calls(&self) -> usize {
        self.payout_calls.load(Ordering::SeqCst)
    }

    pub async fn paid_out(&self) -> HashSet<BookingId> {
        self.paid_out.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_intent(&self, request: IntentRequest) -> Result<PaymentIntent, GatewayError> {
        if let Some(error) = self.fail_next_create.lock().await.take() {
            return Err(error);
        }
        let n = self.intents_created.fetch_add(1, Ordering::SeqCst) + 1;
        let intent_ref = format!("pay_{}_{}", n, request.booking_id);
        self.intent_statuses.lock().await.insert(intent_ref.clone(), IntentStatus::New);
        Ok(PaymentIntent {
            payment_url: Some(format!("https://pay.test/{intent_ref}")),
            intent_ref,
            expires_at: None,
        })
    }

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentDetails, GatewayError> {
        let status = self
            .intent_statuses
            .lock()
            .await
            .get(intent_ref)
            .copied()
            .ok_or_else(|| GatewayError::rejected("404", "unknown intent"))?;
        Ok(IntentDetails {
            intent_ref: intent_ref.to_string(),
            status,
            amount: None,
            charge_ref: status.is_successful().then(|| format!("ch_{intent_ref}")),
        })
    }

    async fn confirm_intent(&self, intent_ref: &str, _method: &str) -> Result<IntentStatus, GatewayError> {
        self.set_intent_status(intent_ref, IntentStatus::Confirmed).await;
        Ok(IntentStatus::Confirmed)
    }

    async fn refund(
        &self,
        charge_ref: &str,
        amount: Money,
        _reason: &str,
        idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        self.refunds.lock().await.push(RefundCall {
            charge_ref: charge_ref.to_string(),
            amount,
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(format!("re_{idempotency_key}"))
    }
}

#[async_trait]
impl PayoutTrigger for FakeGateway {
    async fn release_to_provider(&self, booking: &Booking) -> Result<String, GatewayError> {
        self.payout_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_payouts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_payouts.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::transient("503", "payout service unavailable"));
        }
        self.paid_out.lock().await.insert(booking.id);
        Ok(format!("po_{}", booking.id))
    }
}

pub struct StaleReadStore(pub MemoryBookingStore);

#[async_trait]
impl BookingStore for StaleReadStore {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError> {
        self.0.insert(booking).await
    }

    async fn insert_exclusive(&self, booking: &Booking) -> Result<(), StoreError> {
        self.0.insert_exclusive(booking).await
    }

    async fn get(&self, id: BookingId) -> Result<Booking, StoreError> {
        self.0.get(id).await
    }

    async fn find_by_intent(&self, intent_ref: &str) -> Result<Option<Booking>, StoreError> {
        self.0.find_by_intent(intent_ref).await
    }

    async fn find_active(&self, _booker_id: BookerId, _class_id: ClassId) -> Result<Option<Booking>, StoreError> {
        Ok(None)
    }

    async fn list_for_booker(&self, booker_id: BookerId) -> Result<Vec<Booking>, StoreError> {
        self.0.list_for_booker(booker_id).await
    }

    async fn list_stale_authorizations(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        self.0.list_stale_authorizations(older_than, limit).await
    }

    async fn update(&self, booking: &Booking) -> Result<Booking, StoreError> {
        self.0.update(booking).await
    }
}

/// Full service graph on in-memory backends.
pub struct Harness {
    pub state: Arc<AppState>,
    pub lifecycle: Arc<BookingLifecycleService>,
    pub clock: Arc<ManualClock>,
    pub ledger: MemoryCapacityLedger,
    pub catalog: MemoryClassCatalog,
    pub store: MemoryBookingStore,
    pub schedule: MemoryReleaseSchedule,
    pub gateway: Arc<FakeGateway>,
    pub notifier: RecordingNotificationSink,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config(), friday_morning())
    }

    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self::with_config(test_config(), now)
    }

    pub fn with_config(config: Config, now: DateTime<Utc>) -> Self {
        Self::build(config, now, false)
    }

    /// Duplicate lookups always miss, as when two submissions from the same
    /// booker both read before either has inserted.
    pub fn with_stale_duplicate_reads() -> Self {
        Self::build(test_config(), friday_morning(), true)
    }

    fn build(config: Config, now: DateTime<Utc>, stale_reads: bool) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let ledger = MemoryCapacityLedger::new();
        let catalog = MemoryClassCatalog::new();
        let store = MemoryBookingStore::new();
        let schedule = MemoryReleaseSchedule::new();
        let gateway = Arc::new(FakeGateway::default());
        let notifier = RecordingNotificationSink::new();
        let processed = MemoryProcessedEvents::new(clock.clone(), config.webhook.retention_days);

        let state = AppState::assemble(
            config,
            Backends {
                catalog: Arc::new(catalog.clone()),
                ledger: Arc::new(ledger.clone()),
                store: if stale_reads {
                    Arc::new(StaleReadStore(store.clone()))
                } else {
                    Arc::new(store.clone())
                },
                gateway: gateway.clone(),
                payouts: gateway.clone(),
                notifier: Arc::new(notifier.clone()),
                schedule: Arc::new(schedule.clone()),
                processed: Arc::new(processed),
                clock: clock.clone(),
            },
        );

        Self {
            lifecycle: state.lifecycle.clone(),
            state,
            clock,
            ledger,
            catalog,
            store,
            schedule,
            gateway,
            notifier,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use class_booking::clock::Clock;
        self.clock.now()
    }

    /// Register a class starting `starts_in` from now.
    pub async fn add_class(&self, max_capacity: u32, base_price: i64, starts_in: Duration) -> ClassSession {
        let session = ClassSession {
            id: ClassId::new(),
            max_capacity,
            current_booked_count: 0,
            session_start: self.now() + starts_in,
            base_price: Money::from_minor(base_price),
        };
        self.catalog.insert(session.clone()).await;
        self.ledger.register(session.id, max_capacity).await;
        session
    }

    pub async fn book(&self, class: &ClassSession, booker_id: BookerId, participants: usize) -> BookingResult<Booking> {
        self.lifecycle
            .create_booking(NewBooking {
                class_id: class.id,
                booker_id,
                participants: participants_named(participants),
                session_start: class.session_start,
                special_requests: None,
            })
            .await
    }

    /// Create a booking and run it through payment authorization.
    pub async fn held_booking(&self, class: &ClassSession, participants: usize) -> Booking {
        let booking = self.book(class, BookerId::new(), participants).await.expect("booking created");
        let handle = self.lifecycle.begin_payment(booking.id).await.expect("payment started");
        self.lifecycle
            .on_payment_authorized(booking.id, Some(format!("ch_{}", handle.intent_ref)))
            .await
            .expect("payment authorized")
    }

    pub async fn booked(&self, class: &ClassSession) -> u32 {
        self.lifecycle.capacity(class.id).await.expect("snapshot").booked
    }

    pub async fn schedule_entry(&self, booking_id: BookingId) -> Option<ReleaseEntry> {
        self.state.releases.entry(booking_id).await.expect("schedule readable")
    }

    /// Body and signature header for a gateway event, signed at the current
    /// clock time.
    pub fn signed_event(&self, body: serde_json::Value) -> (Vec<u8>, String) {
        let payload = serde_json::to_vec(&body).expect("json");
        let header = signature::sign(&payload, WEBHOOK_SECRET, self.now().timestamp()).expect("sign");
        (payload, header)
    }
}

pub fn participants_named(count: usize) -> Vec<Participant> {
    (0..count)
        .map(|_| Participant { name: FirstName().fake(), age: (5u8..14).fake() })
        .collect()
}
