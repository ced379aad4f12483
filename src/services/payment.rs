//! payment.rs
//!
//! Service layer for the external payment gateway.
//!
//! Key pieces:
//! 1.  **PaymentGateway / PayoutTrigger**: the contract the lifecycle service
//!     depends on (create, retrieve, confirm, refund, provider payout).
//! 2.  **HttpPaymentGateway**: the HTTP client. Every request carries a
//!     SHA-256 token over its fields plus the merchant secret, every call goes
//!     through a circuit breaker, and idempotent reads are retried once.

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as _;
use failsafe::{backoff, failure_policy, StateMachine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CircuitBreakerConfig, PaymentConfig};
use crate::models::{Booking, BookingId, Money};

/// Error reported by the gateway or by the transport in front of it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("payment gateway error {code}: {message}")]
pub struct GatewayError {
    pub code: String,
    pub message: String,
    /// Network failures, timeouts, 5xx and an open breaker. Safe to retry.
    pub transient: bool,
}

impl GatewayError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), transient: true }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), transient: false }
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::transient("timeout", err.to_string())
        } else if err.is_connect() || err.is_request() {
            GatewayError::transient("network", err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                GatewayError::transient(status.as_u16().to_string(), err.to_string())
            } else {
                GatewayError::rejected(status.as_u16().to_string(), err.to_string())
            }
        } else if err.is_decode() {
            GatewayError::rejected("decode", err.to_string())
        } else {
            GatewayError::transient("transport", err.to_string())
        }
    }
}

/// Gateway-side state of a payment intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    New,
    Authorized,
    Confirmed,
    Rejected,
    Cancelled,
    Expired,
    Refunded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    /// Funds are authorized or captured and can be held for the provider.
    pub fn is_successful(self) -> bool {
        matches!(self, IntentStatus::Authorized | IntentStatus::Confirmed)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, IntentStatus::Rejected | IntentStatus::Cancelled | IntentStatus::Expired)
    }
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub booking_id: BookingId,
    pub amount: Money,
    pub currency: String,
    pub description: String,
}

/// A freshly created intent; `payment_url` is what the client opens to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentIntent {
    pub intent_ref: String,
    pub payment_url: Option<String>,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentDetails {
    pub intent_ref: String,
    pub status: IntentStatus,
    pub amount: Option<Money>,
    pub charge_ref: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    async fn create_intent(&self, request: IntentRequest) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentDetails, GatewayError>;

    async fn confirm_intent(&self, intent_ref: &str, method: &str) -> Result<IntentStatus, GatewayError>;

    /// Refund part or all of a captured charge. `idempotency_key` lets the
    /// gateway collapse retries of the same refund.
    async fn refund(
        &self,
        charge_ref: &str,
        amount: Money,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<String, GatewayError>;
}

/// Moves held funds to the provider. Must be idempotent per booking id.
#[async_trait]
pub trait PayoutTrigger: Send + Sync + 'static {
    async fn release_to_provider(&self, booking: &Booking) -> Result<String, GatewayError>;
}

// --- Wire models of the gateway API ---

#[derive(Debug, Serialize)]
struct PaymentInitRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    amount: i64,
    #[serde(rename = "orderId")]
    order_id: String,
    currency: &'a str,
    description: &'a str,
    #[serde(rename = "successURL", skip_serializing_if = "Option::is_none")]
    success_url: Option<&'a str>,
    #[serde(rename = "failURL", skip_serializing_if = "Option::is_none")]
    fail_url: Option<&'a str>,
    #[serde(rename = "notificationURL", skip_serializing_if = "Option::is_none")]
    notification_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PaymentInitResponse {
    success: bool,
    #[serde(rename = "paymentId")]
    payment_id: Option<String>,
    #[serde(rename = "paymentURL")]
    payment_url: Option<String>,
    #[serde(rename = "expiresAt")]
    expires_at: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaymentCheckRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    #[serde(rename = "paymentId")]
    payment_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PaymentCheckResponse {
    success: bool,
    status: Option<IntentStatus>,
    #[serde(rename = "paymentId")]
    payment_id: Option<String>,
    amount: Option<i64>,
    #[serde(rename = "chargeId")]
    charge_id: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaymentConfirmRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    #[serde(rename = "paymentId")]
    payment_id: &'a str,
    #[serde(rename = "paymentMethod")]
    payment_method: &'a str,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    #[serde(rename = "chargeId")]
    charge_id: &'a str,
    amount: i64,
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct PayoutRequest<'a> {
    #[serde(rename = "teamSlug")]
    team_slug: &'a str,
    token: String,
    amount: i64,
    currency: &'a str,
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "chargeId", skip_serializing_if = "Option::is_none")]
    charge_id: Option<&'a str>,
}

/// Shape shared by confirm, refund and payout responses.
#[derive(Debug, Deserialize)]
struct OperationResponse {
    success: bool,
    status: Option<IntentStatus>,
    #[serde(rename = "refundId")]
    refund_id: Option<String>,
    #[serde(rename = "payoutId")]
    payout_id: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

fn rejection(code: Option<String>, message: Option<String>) -> GatewayError {
    GatewayError::rejected(
        code.unwrap_or_else(|| "rejected".to_string()),
        message.unwrap_or_else(|| "gateway rejected the request".to_string()),
    )
}

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::Constant>, ()>;

/// HTTP client for the gateway API.
pub struct HttpPaymentGateway {
    team_slug: String,
    password: String,
    base_url: String,
    currency: String,
    success_url: Option<String>,
    fail_url: Option<String>,
    webhook_url: Option<String>,
    retry_backoff: Duration,
    http_client: reqwest::Client,
    breaker: Breaker,
}

impl HttpPaymentGateway {
    pub fn from_config(config: &PaymentConfig, breaker: &CircuitBreakerConfig) -> Result<Self, GatewayError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::rejected("client", e.to_string()))?;

        let policy = failure_policy::consecutive_failures(
            breaker.failure_threshold,
            backoff::constant(Duration::from_secs(breaker.timeout_seconds)),
        );

        Ok(Self {
            team_slug: config.merchant_id.clone(),
            password: config.merchant_password.clone(),
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            currency: config.currency.clone(),
            success_url: config.success_url.clone(),
            fail_url: config.fail_url.clone(),
            webhook_url: config.webhook_url.clone(),
            retry_backoff: config.retry_backoff(),
            http_client,
            breaker: failsafe::Config::new().failure_policy(policy).build(),
        })
    }

    /// Token over the concatenated request fields, the merchant secret and
    /// the merchant id.
    fn sign(&self, fields: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_bytes());
        }
        hasher.update(self.password.as_bytes());
        hasher.update(self.team_slug.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Runs one gateway call through the circuit breaker. Only transient
    /// failures count against the breaker; a declined card does not.
    async fn guarded<T, F>(&self, operation: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        match self.breaker.call_with(|e: &GatewayError| e.transient, operation).await {
            Ok(value) => Ok(value),
            Err(failsafe::Error::Rejected) => {
                warn!("Circuit breaker is OPEN - blocking payment gateway request");
                Err(GatewayError::transient("circuit_open", "payment gateway temporarily unavailable"))
            }
            Err(failsafe::Error::Inner(e)) => Err(e),
        }
    }

    async fn post<Req, Resp>(&self, endpoint: &str, body: &Req) -> Result<Resp, GatewayError>
    where
        Req: Serialize + ?Sized,
        Resp: for<'de> Deserialize<'de>,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        self.guarded(async {
            self.http_client
                .post(&url)
                .json(body)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(GatewayError::from_transport)?
                .json::<Resp>()
                .await
                .map_err(GatewayError::from_transport)
        })
        .await
    }

    async fn check_once(&self, intent_ref: &str) -> Result<IntentDetails, GatewayError> {
        let request = PaymentCheckRequest {
            team_slug: &self.team_slug,
            token: self.sign(&[intent_ref]),
            payment_id: intent_ref,
        };
        let response: PaymentCheckResponse = self.post("/api/v1/PaymentCheck/check", &request).await?;
        if !response.success {
            return Err(rejection(response.code, response.message));
        }
        Ok(IntentDetails {
            intent_ref: response.payment_id.unwrap_or_else(|| intent_ref.to_string()),
            status: response.status.unwrap_or(IntentStatus::Unknown),
            amount: response.amount.map(Money::from_minor),
            charge_ref: response.charge_id,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_intent(&self, request: IntentRequest) -> Result<PaymentIntent, GatewayError> {
        let amount = request.amount.minor_units();
        let order_id = request.booking_id.to_string();
        let amount_field = amount.to_string();
        let body = PaymentInitRequest {
            team_slug: &self.team_slug,
            token: self.sign(&[&amount_field, &request.currency, &order_id]),
            amount,
            order_id: order_id.clone(),
            currency: &request.currency,
            description: &request.description,
            success_url: self.success_url.as_deref(),
            fail_url: self.fail_url.as_deref(),
            notification_url: self.webhook_url.as_deref(),
        };

        info!(booking_id = %request.booking_id, amount, currency = %request.currency, "Creating payment intent");

        let response: PaymentInitResponse = self.post("/api/v1/PaymentInit/init", &body).await?;
        if !response.success {
            return Err(rejection(response.code, response.message));
        }
        let intent_ref = response
            .payment_id
            .ok_or_else(|| GatewayError::rejected("missing_payment_id", "gateway returned no payment id"))?;

        Ok(PaymentIntent { intent_ref, payment_url: response.payment_url, expires_at: response.expires_at })
    }

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentDetails, GatewayError> {
        match self.check_once(intent_ref).await {
            Err(e) if e.transient => {
                warn!(intent_ref, error = %e, "Payment check failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                self.check_once(intent_ref).await
            }
            other => other,
        }
    }

    async fn confirm_intent(&self, intent_ref: &str, method: &str) -> Result<IntentStatus, GatewayError> {
        let request = PaymentConfirmRequest {
            team_slug: &self.team_slug,
            token: self.sign(&[intent_ref, method]),
            payment_id: intent_ref,
            payment_method: method,
        };
        let response: OperationResponse = self.post("/api/v1/PaymentConfirm/confirm", &request).await?;
        if !response.success {
            return Err(rejection(response.code, response.message));
        }
        Ok(response.status.unwrap_or(IntentStatus::Unknown))
    }

    async fn refund(
        &self,
        charge_ref: &str,
        amount: Money,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        let amount_field = amount.minor_units().to_string();
        let request = RefundRequest {
            team_slug: &self.team_slug,
            token: self.sign(&[charge_ref, &amount_field]),
            charge_id: charge_ref,
            amount: amount.minor_units(),
            reason,
        };

        info!(charge_ref, amount = %amount, "Issuing refund");

        let url = format!("{}/api/v1/PaymentRefund/refund", self.base_url);
        let response: OperationResponse = self
            .guarded(async {
                self.http_client
                    .post(&url)
                    .header("Idempotency-Key", idempotency_key)
                    .json(&request)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(GatewayError::from_transport)?
                    .json::<OperationResponse>()
                    .await
                    .map_err(GatewayError::from_transport)
            })
            .await?;

        if !response.success {
            return Err(rejection(response.code, response.message));
        }
        response
            .refund_id
            .ok_or_else(|| GatewayError::rejected("missing_refund_id", "gateway returned no refund id"))
    }
}

#[async_trait]
impl PayoutTrigger for HttpPaymentGateway {
    async fn release_to_provider(&self, booking: &Booking) -> Result<String, GatewayError> {
        let amount = booking.pricing.base_price.minor_units();
        let order_id = booking.id.to_string();
        let amount_field = amount.to_string();
        let request = PayoutRequest {
            team_slug: &self.team_slug,
            token: self.sign(&[&amount_field, &self.currency, &order_id]),
            amount,
            currency: &self.currency,
            order_id: order_id.clone(),
            charge_id: booking.charge_ref.as_deref(),
        };

        info!(booking_id = %booking.id, amount, "Releasing funds to provider");

        let url = format!("{}/api/v1/Payout/create", self.base_url);
        let response: OperationResponse = self
            .guarded(async {
                self.http_client
                    .post(&url)
                    .header("Idempotency-Key", format!("payout-{order_id}"))
                    .json(&request)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(GatewayError::from_transport)?
                    .json::<OperationResponse>()
                    .await
                    .map_err(GatewayError::from_transport)
            })
            .await?;

        if !response.success {
            return Err(rejection(response.code, response.message));
        }
        response
            .payout_id
            .ok_or_else(|| GatewayError::rejected("missing_payout_id", "gateway returned no payout id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> HttpPaymentGateway {
        let config = PaymentConfig {
            merchant_id: "team".to_string(),
            merchant_password: "secret".to_string(),
            gateway_url: "http://localhost:1/".to_string(),
            currency: "USD".to_string(),
            request_timeout_secs: 1,
            retry_backoff_ms: 1,
            success_url: None,
            fail_url: None,
            webhook_url: None,
        };
        HttpPaymentGateway::from_config(&config, &CircuitBreakerConfig::default()).unwrap()
    }

    #[test]
    fn token_covers_fields_secret_and_merchant() {
        let gateway = gateway();
        let mut hasher = Sha256::new();
        hasher.update(b"2250USDorder-1secretteam");
        let expected = format!("{:x}", hasher.finalize());

        assert_eq!(gateway.sign(&["2250", "USD", "order-1"]), expected);
        assert_ne!(gateway.sign(&["2251", "USD", "order-1"]), expected);
    }

    #[test]
    fn base_url_is_normalized() {
        assert_eq!(gateway().base_url, "http://localhost:1");
    }

    #[test]
    fn intent_status_parses_unknown_values() {
        let status: IntentStatus = serde_json::from_str("\"PARTIALLY_SETTLED\"").unwrap();
        assert_eq!(status, IntentStatus::Unknown);
        assert!(IntentStatus::Authorized.is_successful());
        assert!(IntentStatus::Expired.is_failed());
    }
}
