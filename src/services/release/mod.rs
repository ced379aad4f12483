//! Durable scheduling of provider payouts.
//!
//! A completed or no-show booking gets one schedule entry keyed by booking
//! id. A periodic sweep claims due entries under a lease, asks the executor
//! to finalize the release and records the outcome. Failures are retried
//! with exponential backoff; after `max_attempts` the entry is parked as
//! `needs_reconciliation` and never retried automatically again.
//! [`FundsReleaseScheduler::recover`] runs the same sweep at startup so
//! releases that came due while the process was down are not lost.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::ReleaseConfig;
use crate::error::{BookingError, StorageError};
use crate::models::{Booking, BookingId, UnknownState};

mod memory;
mod postgres;

pub use memory::MemoryReleaseSchedule;
pub use postgres::PgReleaseSchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    Scheduled,
    Released,
    /// Nothing left to release (booking cancelled, refunded or already paid).
    Closed,
    NeedsReconciliation,
}

impl ReleaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseState::Scheduled => "scheduled",
            ReleaseState::Released => "released",
            ReleaseState::Closed => "closed",
            ReleaseState::NeedsReconciliation => "needs_reconciliation",
        }
    }
}

impl FromStr for ReleaseState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ReleaseState::Scheduled),
            "released" => Ok(ReleaseState::Released),
            "closed" => Ok(ReleaseState::Closed),
            "needs_reconciliation" => Ok(ReleaseState::NeedsReconciliation),
            other => Err(UnknownState { kind: "release state", value: other.to_string() }),
        }
    }
}

impl fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseEntry {
    pub booking_id: BookingId,
    pub release_at: DateTime<Utc>,
    pub state: ReleaseState,
    /// Number of times the entry has been claimed.
    pub attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
}

impl ReleaseEntry {
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_attempt_at.unwrap_or(self.release_at)
    }
}

#[async_trait]
pub trait ReleaseSchedule: Send + Sync + 'static {
    /// Create or reset the entry for `booking_id`.
    async fn upsert(&self, booking_id: BookingId, release_at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Lease up to `limit` scheduled entries due at `now` whose lease is free
    /// or expired. Each claim increments `attempts`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ReleaseEntry>, StorageError>;

    /// Move a leased entry to a final state. A lost lease makes this a no-op.
    async fn finish(
        &self,
        booking_id: BookingId,
        owner: &str,
        state: ReleaseState,
        note: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Give the lease back and try again at `next_attempt_at`.
    async fn retry_later(
        &self,
        booking_id: BookingId,
        owner: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Park `booking_id` as `needs_reconciliation` without a payout attempt.
    /// Replaces any existing entry.
    async fn flag(&self, booking_id: BookingId, at: DateTime<Utc>, note: &str) -> Result<(), StorageError>;

    async fn get(&self, booking_id: BookingId) -> Result<Option<ReleaseEntry>, StorageError>;

    async fn count_scheduled(&self) -> Result<i64, StorageError>;
}

/// Performs the actual release for one booking.
#[async_trait]
pub trait ReleaseExecutor: Send + Sync {
    async fn finalize_release(&self, booking_id: BookingId) -> Result<Booking, BookingError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub released: u32,
    pub closed: u32,
    pub retried: u32,
    pub escalated: u32,
}

impl SweepReport {
    pub fn claimed(&self) -> u32 {
        self.released + self.closed + self.retried + self.escalated
    }

    fn absorb(&mut self, other: SweepReport) {
        self.released += other.released;
        self.closed += other.closed;
        self.retried += other.retried;
        self.escalated += other.escalated;
    }
}

pub struct FundsReleaseScheduler {
    schedule: Arc<dyn ReleaseSchedule>,
    clock: Arc<dyn Clock>,
    config: ReleaseConfig,
    owner: String,
}

impl FundsReleaseScheduler {
    pub fn new(schedule: Arc<dyn ReleaseSchedule>, clock: Arc<dyn Clock>, config: ReleaseConfig) -> Self {
        let owner = format!("release-worker-{}", uuid::Uuid::new_v4());
        Self { schedule, clock, config, owner }
    }

    pub async fn schedule(&self, booking_id: BookingId, release_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.schedule.upsert(booking_id, release_at).await?;
        info!(booking_id = %booking_id, release_at = %release_at, "Funds release scheduled");
        Ok(())
    }

    /// Record funds that the sweep must not pay out and an operator has to
    /// settle by hand.
    pub async fn flag_for_reconciliation(&self, booking_id: BookingId, note: &str) -> Result<(), StorageError> {
        self.schedule.flag(booking_id, self.clock.now(), note).await?;
        error!(booking_id = %booking_id, needs_reconciliation = true, note, "Held funds flagged for manual reconciliation");
        Ok(())
    }

    pub async fn entry(&self, booking_id: BookingId) -> Result<Option<ReleaseEntry>, StorageError> {
        self.schedule.get(booking_id).await
    }

    /// Delay before the next attempt after `attempts` failed claims.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        Duration::seconds(self.config.backoff_base_secs.saturating_mul(1i64 << exponent))
    }

    /// Claim one batch of due entries and execute them.
    pub async fn sweep(&self, executor: &dyn ReleaseExecutor) -> Result<SweepReport, StorageError> {
        let now = self.clock.now();
        let lease_until = now + Duration::seconds(self.config.lease_secs);
        let due = self
            .schedule
            .claim_due(now, &self.owner, lease_until, self.config.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for entry in due {
            self.execute(executor, &entry, &mut report).await?;
        }

        if report.claimed() > 0 {
            info!(
                released = report.released,
                closed = report.closed,
                retried = report.retried,
                escalated = report.escalated,
                "Release sweep finished"
            );
        }
        Ok(report)
    }

    async fn execute(
        &self,
        executor: &dyn ReleaseExecutor,
        entry: &ReleaseEntry,
        report: &mut SweepReport,
    ) -> Result<(), StorageError> {
        let booking_id = entry.booking_id;
        match executor.finalize_release(booking_id).await {
            Ok(_) => {
                self.schedule.finish(booking_id, &self.owner, ReleaseState::Released, None).await?;
                report.released += 1;
            }
            Err(e @ (BookingError::StateConflict { .. } | BookingError::BookingNotFound(_))) => {
                warn!(booking_id = %booking_id, error = %e, "Nothing to release, closing schedule entry");
                let note = e.to_string();
                self.schedule.finish(booking_id, &self.owner, ReleaseState::Closed, Some(&note)).await?;
                report.closed += 1;
            }
            Err(e) if entry.attempts >= self.config.max_attempts => {
                error!(
                    booking_id = %booking_id,
                    attempts = entry.attempts,
                    error = %e,
                    "Funds release exhausted its retries, needs manual reconciliation"
                );
                let note = e.to_string();
                self.schedule
                    .finish(booking_id, &self.owner, ReleaseState::NeedsReconciliation, Some(&note))
                    .await?;
                report.escalated += 1;
            }
            Err(e) => {
                let next_attempt_at = self.clock.now() + self.backoff(entry.attempts);
                warn!(
                    booking_id = %booking_id,
                    attempts = entry.attempts,
                    next_attempt_at = %next_attempt_at,
                    error = %e,
                    "Funds release failed, will retry"
                );
                self.schedule
                    .retry_later(booking_id, &self.owner, &e.to_string(), next_attempt_at)
                    .await?;
                report.retried += 1;
            }
        }
        Ok(())
    }

    /// Drain everything that is already due. Run once at startup.
    pub async fn recover(&self, executor: &dyn ReleaseExecutor) -> Result<SweepReport, StorageError> {
        let pending = self.schedule.count_scheduled().await?;
        info!(pending, "Recovering scheduled fund releases");

        let mut total = SweepReport::default();
        loop {
            let report = self.sweep(executor).await?;
            total.absorb(report);
            // Stop once a batch comes back short; retried entries are not due
            // again until their backoff elapses.
            if report.claimed() < self.config.batch_size.max(1) as u32 || report.released + report.closed == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Recover, then sweep on a fixed interval until the task is aborted.
    pub fn spawn(self: Arc<Self>, executor: Arc<dyn ReleaseExecutor>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.recover(executor.as_ref()).await {
                error!("Release recovery failed: {}", e);
            }

            let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.config.sweep_interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep(executor.as_ref()).await {
                    error!("Release sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn scheduler(base: i64) -> FundsReleaseScheduler {
        let config = ReleaseConfig { backoff_base_secs: base, ..Default::default() };
        FundsReleaseScheduler::new(
            Arc::new(MemoryReleaseSchedule::new()),
            Arc::new(ManualClock::new(Utc::now())),
            config,
        )
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let s = scheduler(60);
        assert_eq!(s.backoff(1), Duration::seconds(60));
        assert_eq!(s.backoff(2), Duration::seconds(120));
        assert_eq!(s.backoff(4), Duration::seconds(480));
    }

    #[test]
    fn backoff_is_capped() {
        let s = scheduler(1);
        assert_eq!(s.backoff(40), Duration::seconds(1 << 16));
    }

    #[test]
    fn release_state_round_trips_through_str() {
        for state in [
            ReleaseState::Scheduled,
            ReleaseState::Released,
            ReleaseState::Closed,
            ReleaseState::NeedsReconciliation,
        ] {
            assert_eq!(state.as_str().parse::<ReleaseState>().unwrap(), state);
        }
    }
}
