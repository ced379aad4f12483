pub mod clock;
pub mod config;
pub mod controllers;
pub mod database;
pub mod error;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod services;

use std::sync::Arc;
use thiserror::Error;

use clock::{Clock, SystemClock};
use config::Config;
use services::catalog::{ClassCatalog, PgClassCatalog};
use services::ledger::{CapacityLedger, PgCapacityLedger};
use services::lifecycle::{BookingLifecycleService, LifecycleComponents};
use services::notifications::{sink_from_config, NotificationSink, NotifyError};
use services::payment::{GatewayError, HttpPaymentGateway, PaymentGateway, PayoutTrigger};
use services::reconciliation::PaymentReconciler;
use services::release::{FundsReleaseScheduler, PgReleaseSchedule, ReleaseSchedule};
use services::store::{BookingStore, PgBookingStore};
use services::webhook::{ProcessedEvents, RedisProcessedEvents, WebhookIngestor};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("payment gateway client: {0}")]
    Gateway(#[from] GatewayError),
    #[error("notification sink: {0}")]
    Notifications(#[from] NotifyError),
}

/// Storage and integration backends the services run on.
pub struct Backends {
    pub catalog: Arc<dyn ClassCatalog>,
    pub ledger: Arc<dyn CapacityLedger>,
    pub store: Arc<dyn BookingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub payouts: Arc<dyn PayoutTrigger>,
    pub notifier: Arc<dyn NotificationSink>,
    pub schedule: Arc<dyn ReleaseSchedule>,
    pub processed: Arc<dyn ProcessedEvents>,
    pub clock: Arc<dyn Clock>,
}

// Shared state for the whole application
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub lifecycle: Arc<BookingLifecycleService>,
    pub webhooks: Arc<WebhookIngestor>,
    pub releases: Arc<FundsReleaseScheduler>,
    pub reconciler: Arc<PaymentReconciler>,
}

impl AppState {
    /// Connect to Postgres and Redis, run migrations and wire the services.
    pub async fn connect(config: Config) -> Result<Arc<Self>, StartupError> {
        let db = database::Database::new(&config.database).await?;
        db.run_migrations().await?;
        tracing::info!("Database connected");

        let redis = redis_client::RedisClient::new(&config.redis).await?;
        tracing::info!("Redis connected");

        let gateway = Arc::new(HttpPaymentGateway::from_config(&config.payment, &config.circuit_breaker)?);
        let backends = Backends {
            catalog: Arc::new(PgClassCatalog::new(db.pool.clone())),
            ledger: Arc::new(PgCapacityLedger::new(db.pool.clone())),
            store: Arc::new(PgBookingStore::new(db.pool.clone())),
            gateway: gateway.clone(),
            payouts: gateway,
            notifier: sink_from_config(&config.notifications)?,
            schedule: Arc::new(PgReleaseSchedule::new(db.pool.clone())),
            processed: Arc::new(RedisProcessedEvents::new(redis.conn.clone(), config.webhook.retention_days)),
            clock: Arc::new(SystemClock),
        };

        Ok(Self::assemble(config, backends))
    }

    pub fn assemble(config: Config, backends: Backends) -> Arc<Self> {
        let releases = Arc::new(FundsReleaseScheduler::new(
            backends.schedule,
            backends.clock.clone(),
            config.release.clone(),
        ));

        let lifecycle = Arc::new(BookingLifecycleService::new(
            LifecycleComponents {
                catalog: backends.catalog,
                ledger: backends.ledger,
                store: backends.store,
                gateway: backends.gateway,
                payouts: backends.payouts,
                notifier: backends.notifier,
                releases: releases.clone(),
                clock: backends.clock.clone(),
            },
            config.booking.clone(),
            config.payment.currency.clone(),
        ));

        let webhooks = Arc::new(WebhookIngestor::new(
            lifecycle.clone(),
            backends.processed,
            backends.clock.clone(),
            &config.webhook,
        ));

        let reconciler = Arc::new(PaymentReconciler::new(
            lifecycle.clone(),
            backends.clock,
            config.reconciliation.clone(),
        ));

        Arc::new(Self { config, lifecycle, webhooks, releases, reconciler })
    }

    /// Start the release sweep (after recovery) and the payment reconciliation loop.
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.releases.clone().spawn(self.lifecycle.clone()),
            self.reconciler.clone().spawn(),
        ]
    }
}
