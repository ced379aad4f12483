use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use super::{to_api_error, ApiResult};
use crate::services::webhook::WebhookError;
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-payment-signature";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/payment", post(payment_webhook))
}

// POST /api/webhooks/payment
//
// 200 for everything the gateway should not redeliver, 401 for a bad
// signature, 500 when the event must be retried.
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match state.webhooks.ingest(&body, signature).await {
        Ok(outcome) => Ok(Json(json!({ "success": true, "outcome": outcome }))),
        Err(WebhookError::SignatureInvalid(_)) => {
            Err(to_api_error(StatusCode::UNAUTHORIZED, "invalid webhook signature"))
        }
        Err(e) => {
            tracing::error!("Webhook processing failed: {}", e);
            Err(to_api_error(StatusCode::INTERNAL_SERVER_ERROR, "webhook processing failed"))
        }
    }
}
