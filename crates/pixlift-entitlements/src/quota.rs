//! Local-day quota bookkeeping
//!
//! The free-action quota resets when the calendar day changes in the
//! device's local time zone. No task runs at midnight: every read passes
//! through [`QuotaClock::reset_if_needed`], so the first touch on a new
//! day observes a zeroed counter and stale counters are never served.

use chrono::{Days, Local, NaiveDate};
use parking_lot::RwLock;

use crate::balance::BalanceRecord;

/// Source of the current quota day
pub trait QuotaClock: Send + Sync {
    /// The calendar date quota counters are bound to.
    fn today(&self) -> NaiveDate;

    /// Returns `record` with the quota counter zeroed when its day is
    /// stale. Idempotent within a day; `updated_at` is left alone since
    /// this is a read-side view, not an authoritative write.
    fn reset_if_needed(&self, record: &BalanceRecord) -> BalanceRecord {
        let today = self.today();
        if record.quota_day == today {
            return record.clone();
        }
        let mut reset = record.clone();
        reset.quota_used = 0;
        reset.quota_day = today;
        reset
    }
}

/// Quota clock backed by the device's local time zone
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemQuotaClock;

impl QuotaClock for SystemQuotaClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Manually controlled clock for deterministic tests
pub struct FixedQuotaClock {
    today: RwLock<NaiveDate>,
}

impl FixedQuotaClock {
    pub fn new(today: NaiveDate) -> Self {
        FixedQuotaClock {
            today: RwLock::new(today),
        }
    }

    /// Pins the clock to the given date.
    pub fn set(&self, today: NaiveDate) {
        *self.today.write() = today;
    }

    /// Moves the clock forward by whole days.
    pub fn advance_days(&self, days: u64) {
        let mut today = self.today.write();
        if let Some(next) = today.checked_add_days(Days::new(days)) {
            *today = next;
        }
    }
}

impl QuotaClock for FixedQuotaClock {
    fn today(&self) -> NaiveDate {
        *self.today.read()
    }
}
