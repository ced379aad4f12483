use serde::Deserialize;
use std::time::Duration;

use crate::models::Money;

/// Root configuration, one section per concern.
///
/// Loaded from environment variables with `__` as the section separator,
/// e.g. `APP__PORT=8080`, `DATABASE__URL=postgres://...`,
/// `BOOKING__SERVICE_FEE=250`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub payment: PaymentConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub booking: BookingPolicy,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            environment: "development".to_string(),
            rust_log: "class_booking=debug,tower_http=debug".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_pool_size() -> u32 {
    20
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Payment gateway credentials and client behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub merchant_id: String,
    pub merchant_password: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub fail_url: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_gateway_url() -> String {
    "https://gateway.example.com".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl PaymentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, timeout_seconds: 60 }
    }
}

/// Business rules applied when bookings are created and cancelled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BookingPolicy {
    /// Flat fee per booking in minor units, independent of participant count.
    pub service_fee: i64,
    pub allow_repeat_bookings: bool,
    /// Cancelling more than this many hours ahead refunds everything.
    pub full_refund_hours: i64,
    /// Cancelling more than this many hours ahead (and within the full window)
    /// refunds `partial_refund_percent`.
    pub partial_refund_hours: i64,
    pub partial_refund_percent: u8,
    pub hold_working_days: u32,
    /// Retries when a compare-and-set update loses a race.
    pub max_update_attempts: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            service_fee: 250,
            allow_repeat_bookings: false,
            full_refund_hours: 24,
            partial_refund_hours: 2,
            partial_refund_percent: 50,
            hold_working_days: 3,
            max_update_attempts: 3,
        }
    }
}

impl BookingPolicy {
    pub fn service_fee(&self) -> Money {
        Money::from_minor(self.service_fee)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub sweep_interval_secs: u64,
    pub lease_secs: i64,
    pub max_attempts: u32,
    pub backoff_base_secs: i64,
    pub batch_size: i64,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            lease_secs: 120,
            max_attempts: 5,
            backoff_base_secs: 60,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    pub stale_after_minutes: i64,
    pub batch_size: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self { interval_secs: 300, stale_after_minutes: 15, batch_size: 100 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub secret: String,
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_tolerance_secs() -> i64 {
    300
}

fn default_retention_days() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Downstream delivery endpoint. Events are only logged when unset.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { url: None, timeout_secs: 5 }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
