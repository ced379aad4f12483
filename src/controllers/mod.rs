pub mod bookings;
pub mod webhooks;

use axum::{http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::error::{BookingError, ErrorKind};

pub fn routes() -> Router<Arc<crate::AppState>> {
    Router::new()
        .merge(bookings::routes())
        .merge(webhooks::routes())
}

/// Full HTTP application: health probes plus the API under `/api`.
pub fn app(state: Arc<crate::AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Class Booking API v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    message: String,
}

pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn to_api_error(status: StatusCode, message: &str) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { success: false, kind: None, message: message.to_string() }))
}

pub fn status_for(err: &BookingError) -> StatusCode {
    match err {
        BookingError::Validation(_) => StatusCode::BAD_REQUEST,
        BookingError::BookingNotFound(_) | BookingError::ClassNotFound(_) => StatusCode::NOT_FOUND,
        BookingError::CapacityExceeded(_)
        | BookingError::DuplicateBooking { .. }
        | BookingError::StateConflict { .. }
        | BookingError::ConcurrentModification(_) => StatusCode::CONFLICT,
        BookingError::Gateway(e) if e.transient => StatusCode::SERVICE_UNAVAILABLE,
        BookingError::Gateway(_) => StatusCode::PAYMENT_REQUIRED,
        BookingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a lifecycle error to its response. Faults are logged with their
/// details; callers only see the public message.
pub fn booking_error(err: BookingError) -> (StatusCode, Json<ApiError>) {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(kind = ?err.kind(), "Request failed: {}", err);
    } else {
        tracing::debug!(kind = ?err.kind(), "Request rejected: {}", err);
    }
    (
        status,
        Json(ApiError { success: false, kind: Some(err.kind()), message: err.public_message() }),
    )
}
