mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use class_booking::controllers::{self, webhooks::SIGNATURE_HEADER};
use class_booking::middleware::{USER_ID_HEADER, USER_ROLE_HEADER};
use class_booking::models::{BookerId, ClassSession};
use common::{participants_named, Harness};

struct Api {
    h: Harness,
    app: Router,
}

impl Api {
    fn new() -> Self {
        let h = Harness::new();
        let app = controllers::app(h.state.clone());
        Self { h, app }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, body)
    }

    async fn call(&self, method: &str, uri: &str, user: Option<(BookerId, &str)>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = user {
            builder = builder.header(USER_ID_HEADER, id.to_string()).header(USER_ROLE_HEADER, role);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn create(&self, booker: BookerId, class: &ClassSession, participants: usize) -> (StatusCode, Value) {
        let body = json!({
            "classId": class.id,
            "participants": participants_named(participants),
            "sessionStart": class.session_start,
        });
        self.call("POST", "/api/bookings", Some((booker, "booker")), Some(body)).await
    }
}

#[tokio::test]
async fn health_endpoints_respond() {
    let api = Api::new();
    let response = api
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn requests_without_identity_are_unauthorized() {
    let api = Api::new();
    let (status, _) = api.call("GET", "/api/bookings", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = api
        .call("GET", "/api/bookings", Some((BookerId::new(), "admin")), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn create_and_fetch_booking() {
    let api = Api::new();
    let class = api.h.add_class(4, 2000, Duration::days(3)).await;
    let booker = BookerId::new();

    let (status, body) = api.create(booker, &class, 2).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["payment_status"], "unpaid");
    assert_eq!(body["pricing"]["total_amount"], 2250);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, fetched) = api.call("GET", &format!("/api/bookings/{id}"), Some((booker, "booker")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id.as_str());

    // other bookers cannot see it
    let (status, _) = api
        .call("GET", &format!("/api/bookings/{id}"), Some((BookerId::new(), "booker")), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, list) = api.call("GET", "/api/bookings", Some((booker, "booker")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invalid_bodies_are_bad_requests() {
    let api = Api::new();
    let class = api.h.add_class(4, 2000, Duration::days(3)).await;

    let (status, body) = api.create(BookerId::new(), &class, 0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let blank_name = json!({
        "classId": class.id,
        "participants": [{ "name": "", "age": 7 }],
        "sessionStart": class.session_start,
    });
    let (status, _) = api
        .call("POST", "/api/bookings", Some((BookerId::new(), "booker")), Some(blank_name))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn full_class_and_duplicates_conflict() {
    let api = Api::new();
    let class = api.h.add_class(1, 2000, Duration::days(3)).await;
    let booker = BookerId::new();

    assert_eq!(api.create(booker, &class, 1).await.0, StatusCode::CREATED);

    let (status, body) = api.create(booker, &class, 1).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "DUPLICATE_BOOKING");

    let (status, body) = api.create(BookerId::new(), &class, 1).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "CAPACITY_EXCEEDED");
    assert_eq!(body["message"], "class is full");
}

#[tokio::test]
async fn payment_and_cancellation_flow() {
    let api = Api::new();
    let class = api.h.add_class(4, 2000, Duration::hours(10)).await;
    let booker = BookerId::new();
    let (_, created) = api.create(booker, &class, 1).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, handle) = api
        .call("POST", &format!("/api/bookings/{id}/payment"), Some((booker, "booker")), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(handle["reused"], false);
    assert!(handle["payment_url"].is_string());

    let (payload, header) = api.h.signed_event(json!({
        "eventId": "evt_api",
        "paymentId": handle["intent_ref"],
        "orderId": id.as_str(),
        "status": "CONFIRMED"
    }));
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/payment")
        .header(SIGNATURE_HEADER, header)
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = api.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "processed");

    // cancel without a body, 10h before the session
    let (status, cancellation) = api
        .call("POST", &format!("/api/bookings/{id}/cancel"), Some((booker, "booker")), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancellation["refund_percent"], 50);
    assert_eq!(cancellation["refund_amount"], 1125);
    assert_eq!(cancellation["booking"]["status"], "cancelled");
    assert_eq!(cancellation["booking"]["payment_status"], "refunded");

    let (status, body) = api
        .call("POST", &format!("/api/bookings/{id}/cancel"), Some((booker, "booker")), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "STATE_CONFLICT");
}

#[tokio::test]
async fn only_providers_close_out_classes() {
    let api = Api::new();
    let class = api.h.add_class(4, 2000, Duration::days(1)).await;
    let booking = api.h.held_booking(&class, 1).await;
    let uri = format!("/api/bookings/{}/complete", booking.id);

    let (status, _) = api.call("POST", &uri, Some((booking.booker_id, "booker")), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = api.call("POST", &uri, Some((BookerId::new(), "provider")), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["payment_status"], "held");
    assert!(body["funds_release_date"].is_string());
}

#[tokio::test]
async fn webhook_with_bad_signature_is_unauthorized() {
    let api = Api::new();
    let request = Request::builder()
        .method("POST")
        .uri("/api/webhooks/payment")
        .header(SIGNATURE_HEADER, "t=1,v1=deadbeef")
        .body(Body::from(r#"{"eventId":"evt","paymentId":"p","status":"CONFIRMED"}"#))
        .unwrap();

    let (status, body) = api.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}
