//! Time-tiered cancellation refunds.

use chrono::Duration;
use serde::Serialize;

use crate::config::BookingPolicy;
use crate::models::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefundQuote {
    pub percent: u8,
    pub amount: Money,
}

#[derive(Debug, Clone, Copy)]
pub struct RefundSchedule {
    full_after: Duration,
    partial_after: Duration,
    partial_percent: u8,
}

impl RefundSchedule {
    pub fn from_policy(policy: &BookingPolicy) -> Self {
        Self {
            full_after: Duration::hours(policy.full_refund_hours),
            partial_after: Duration::hours(policy.partial_refund_hours),
            partial_percent: policy.partial_refund_percent.min(100),
        }
    }

    /// Both tier bounds are exclusive: cancelling exactly 24h ahead gets the
    /// partial refund, exactly 2h ahead gets nothing.
    pub fn percent(&self, until_session: Duration) -> u8 {
        if until_session > self.full_after {
            100
        } else if until_session > self.partial_after {
            self.partial_percent
        } else {
            0
        }
    }

    pub fn quote(&self, total: Money, until_session: Duration) -> RefundQuote {
        let percent = self.percent(until_session);
        RefundQuote { percent, amount: total.percent(percent) }
    }
}

impl Default for RefundSchedule {
    fn default() -> Self {
        Self::from_policy(&BookingPolicy::default())
    }
}
