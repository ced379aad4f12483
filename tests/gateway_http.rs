mod common;

use chrono::Duration;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use class_booking::config::{CircuitBreakerConfig, PaymentConfig};
use class_booking::models::{BookingId, Money};
use class_booking::services::payment::{HttpPaymentGateway, IntentRequest, IntentStatus, PaymentGateway, PayoutTrigger};
use common::Harness;

fn gateway_for(server: &MockServer, failure_threshold: u32) -> HttpPaymentGateway {
    let config = PaymentConfig {
        merchant_id: "team".to_string(),
        merchant_password: "secret".to_string(),
        gateway_url: server.uri(),
        currency: "USD".to_string(),
        request_timeout_secs: 2,
        retry_backoff_ms: 1,
        success_url: None,
        fail_url: None,
        webhook_url: Some("https://booking.test/api/webhooks/payment".to_string()),
    };
    let breaker = CircuitBreakerConfig { failure_threshold, timeout_seconds: 60 };
    HttpPaymentGateway::from_config(&config, &breaker).unwrap()
}

fn intent_request(booking_id: BookingId) -> IntentRequest {
    IntentRequest {
        booking_id,
        amount: Money::from_minor(2250),
        currency: "USD".to_string(),
        description: "Class booking for 1 participant(s)".to_string(),
    }
}

#[tokio::test]
async fn creates_intent_with_order_id_and_token() {
    let server = MockServer::start().await;
    let booking_id = BookingId::new();

    Mock::given(method("POST"))
        .and(path("/api/v1/PaymentInit/init"))
        .and(body_partial_json(json!({
            "teamSlug": "team",
            "amount": 2250,
            "orderId": booking_id.to_string(),
            "currency": "USD",
            "notificationURL": "https://booking.test/api/webhooks/payment"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "paymentId": "pay_123",
            "paymentURL": "https://pay.test/pay_123",
            "expiresAt": "2026-10-16T11:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let intent = gateway_for(&server, 5).create_intent(intent_request(booking_id)).await.unwrap();

    assert_eq!(intent.intent_ref, "pay_123");
    assert_eq!(intent.payment_url.as_deref(), Some("https://pay.test/pay_123"));
}

#[tokio::test]
async fn declined_intent_is_not_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/PaymentInit/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "code": "INVALID_AMOUNT",
            "message": "amount too small"
        })))
        .mount(&server)
        .await;

    let err = gateway_for(&server, 5).create_intent(intent_request(BookingId::new())).await.unwrap_err();

    assert!(!err.transient);
    assert_eq!(err.code, "INVALID_AMOUNT");
    assert_eq!(err.message, "amount too small");
}

#[tokio::test]
async fn retrieve_retries_once_after_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/PaymentCheck/check"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/PaymentCheck/check"))
        .and(body_partial_json(json!({ "paymentId": "pay_9" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "paymentId": "pay_9",
            "status": "CONFIRMED",
            "amount": 2250,
            "chargeId": "ch_9"
        })))
        .mount(&server)
        .await;

    let details = gateway_for(&server, 5).retrieve_intent("pay_9").await.unwrap();

    assert_eq!(details.status, IntentStatus::Confirmed);
    assert_eq!(details.amount, Some(Money::from_minor(2250)));
    assert_eq!(details.charge_ref.as_deref(), Some("ch_9"));
}

#[tokio::test]
async fn client_errors_are_rejections_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/PaymentCheck/check"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = gateway_for(&server, 5).retrieve_intent("pay_missing").await.unwrap_err();

    assert!(!err.transient);
    assert_eq!(err.code, "404");
}

#[tokio::test]
async fn refund_carries_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/PaymentRefund/refund"))
        .and(header("Idempotency-Key", "refund-abc"))
        .and(body_partial_json(json!({ "chargeId": "ch_1", "amount": 1125 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "refundId": "re_1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let refund_ref = gateway_for(&server, 5)
        .refund("ch_1", Money::from_minor(1125), "cancelled by booker", "refund-abc")
        .await
        .unwrap();

    assert_eq!(refund_ref, "re_1");
}

#[tokio::test]
async fn payout_sends_class_price_without_service_fee() {
    let h = Harness::new();
    let class = h.add_class(5, 2000, Duration::days(1)).await;
    let booking = h.held_booking(&class, 1).await;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/Payout/create"))
        .and(header("Idempotency-Key", format!("payout-{}", booking.id).as_str()))
        .and(body_partial_json(json!({
            "amount": 2000,
            "orderId": booking.id.to_string(),
            "chargeId": booking.charge_ref.clone().unwrap()
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "payoutId": "po_1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let payout_ref = gateway_for(&server, 5).release_to_provider(&booking).await.unwrap();
    assert_eq!(payout_ref, "po_1");
}

#[tokio::test]
async fn breaker_opens_after_consecutive_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/PaymentInit/init"))
        .respond_with(ResponseTemplate::new(502))
        .expect(2)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, 2);
    for _ in 0..2 {
        let err = gateway.create_intent(intent_request(BookingId::new())).await.unwrap_err();
        assert!(err.transient);
        assert_eq!(err.code, "502");
    }

    let err = gateway.create_intent(intent_request(BookingId::new())).await.unwrap_err();
    assert!(err.transient);
    assert_eq!(err.code, "circuit_open");
}
