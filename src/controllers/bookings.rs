use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

use super::{booking_error, to_api_error, ApiResult};
use crate::middleware::AuthUser;
use crate::models::{Booking, BookingId, ClassId, Participant};
use crate::services::lifecycle::NewBooking;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", get(list_bookings).post(create_booking))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/payment", post(begin_payment))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/complete", post(complete_class))
        .route("/bookings/{id}/no-show", post(mark_no_show))
}

/* ---------- request bodies ---------- */

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub class_id: ClassId,
    #[validate(length(min = 1, max = 20, message = "between 1 and 20 participants"), nested)]
    pub participants: Vec<ParticipantInput>,
    pub session_start: DateTime<Utc>,
    #[validate(length(max = 1000))]
    pub special_requests: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize, Validate)]
pub struct ParticipantInput {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(range(max = 120))]
    pub age: u8,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/* ---------- helpers ---------- */

/// Bookers only see their own bookings; anything else looks like a 404.
async fn owned_booking(state: &AppState, user: &AuthUser, id: BookingId) -> ApiResult<Booking> {
    let booking = state.lifecycle.get(id).await.map_err(booking_error)?;
    if booking.booker_id != user.user_id && !user.is_provider() {
        return Err(to_api_error(StatusCode::NOT_FOUND, &format!("booking {} not found", id)));
    }
    Ok(booking)
}

fn require_provider(user: &AuthUser) -> ApiResult<()> {
    if !user.is_provider() {
        return Err(to_api_error(StatusCode::FORBIDDEN, "only the class provider may do this"));
    }
    Ok(())
}

fn validation_failed(errors: validator::ValidationErrors) -> (StatusCode, Json<super::ApiError>) {
    to_api_error(StatusCode::BAD_REQUEST, &errors.to_string())
}

/* ---------- handlers ---------- */

// POST /api/bookings
async fn create_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateBookingRequest>,
) -> ApiResult<impl IntoResponse> {
    req.validate().map_err(validation_failed)?;

    let booking = state
        .lifecycle
        .create_booking(NewBooking {
            class_id: req.class_id,
            booker_id: user.user_id,
            participants: req
                .participants
                .into_iter()
                .map(|p| Participant { name: p.name.trim().to_string(), age: p.age })
                .collect(),
            session_start: req.session_start,
            special_requests: req.special_requests,
        })
        .await
        .map_err(booking_error)?;

    Ok((StatusCode::CREATED, Json(booking)))
}

// GET /api/bookings
async fn list_bookings(State(state): State<Arc<AppState>>, user: AuthUser) -> ApiResult<impl IntoResponse> {
    let bookings = state.lifecycle.list_for_booker(user.user_id).await.map_err(booking_error)?;
    Ok(Json(bookings))
}

// GET /api/bookings/{id}
async fn get_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<BookingId>,
) -> ApiResult<impl IntoResponse> {
    let booking = owned_booking(&state, &user, id).await?;
    Ok(Json(booking))
}

// POST /api/bookings/{id}/payment
async fn begin_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<BookingId>,
) -> ApiResult<impl IntoResponse> {
    owned_booking(&state, &user, id).await?;
    let handle = state.lifecycle.begin_payment(id).await.map_err(booking_error)?;
    Ok(Json(handle))
}

// POST /api/bookings/{id}/cancel
async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<BookingId>,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body.unwrap_or_default();
    req.validate().map_err(validation_failed)?;

    owned_booking(&state, &user, id).await?;
    let cancellation = state.lifecycle.cancel(id, req.reason).await.map_err(booking_error)?;
    Ok(Json(cancellation))
}

// POST /api/bookings/{id}/complete
async fn complete_class(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<BookingId>,
) -> ApiResult<impl IntoResponse> {
    require_provider(&user)?;
    let booking = state.lifecycle.mark_class_completed(id).await.map_err(booking_error)?;
    Ok(Json(booking))
}

// POST /api/bookings/{id}/no-show
async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<BookingId>,
) -> ApiResult<impl IntoResponse> {
    require_provider(&user)?;
    let booking = state.lifecycle.mark_no_show(id).await.map_err(booking_error)?;
    Ok(Json(booking))
}
