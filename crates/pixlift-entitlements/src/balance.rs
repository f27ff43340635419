//! Balance records, quota limits, and credit grants

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Paid credits are whole, non-negative units
pub type Credits = u64;

/// Daily free-action allowance attached to a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLimit {
    /// At most this many actions per day; zero is not a valid limit
    Limited(u32),
    /// No daily ceiling (promotional and grandfathered balances)
    Unlimited,
}

impl QuotaLimit {
    /// True when `used` actions leave room for one more today.
    pub fn allows(&self, used: u32) -> bool {
        match self {
            QuotaLimit::Limited(limit) => used < *limit,
            QuotaLimit::Unlimited => true,
        }
    }

    /// Actions left today, or `None` for an unlimited allowance.
    pub fn remaining(&self, used: u32) -> Option<u32> {
        match self {
            QuotaLimit::Limited(limit) => Some(limit.saturating_sub(used)),
            QuotaLimit::Unlimited => None,
        }
    }
}

/// Balance snapshot for one identity.
///
/// Counters are unsigned on purpose: a record that would go negative is
/// rejected at the edge instead of clamped, so corruption stays visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    /// Storage key of the owning identity
    pub identity_key: String,
    /// Paid credits available for consumption
    pub credits: Credits,
    /// Actions consumed against today's quota
    pub quota_used: u32,
    /// Allowance `quota_used` is checked against
    pub quota_limit: QuotaLimit,
    /// Local calendar day `quota_used` belongs to
    pub quota_day: NaiveDate,
    /// Whether the owning identity holds an active premium subscription
    pub is_premium: bool,
    /// When this snapshot was last written
    pub updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    /// Creates a record with an opening credit balance and a fresh quota.
    pub fn new(
        identity_key: String,
        credits: Credits,
        quota_limit: QuotaLimit,
        quota_day: NaiveDate,
    ) -> Self {
        BalanceRecord {
            identity_key,
            credits,
            quota_used: 0,
            quota_limit,
            quota_day,
            is_premium: false,
            updated_at: Utc::now(),
        }
    }

    /// True when the record satisfies its own invariants. Records that
    /// fail this check are treated as corrupt by every consumer.
    pub fn is_valid(&self) -> bool {
        match self.quota_limit {
            QuotaLimit::Limited(limit) => limit > 0,
            QuotaLimit::Unlimited => true,
        }
    }

    /// Free quota left today, or `None` for an unlimited allowance.
    pub fn quota_remaining(&self) -> Option<u32> {
        self.quota_limit.remaining(self.quota_used)
    }

    /// True when a non-premium consume could succeed against this
    /// snapshot: at least one credit and quota headroom for today.
    pub fn can_consume(&self) -> bool {
        self.credits > 0 && self.quota_limit.allows(self.quota_used)
    }

    /// Adds credits, saturating at the type boundary.
    pub fn add_credits(&mut self, amount: Credits) {
        self.credits = self.credits.saturating_add(amount);
        self.updated_at = Utc::now();
    }
}

/// Why credits were added to a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    /// Opening grant for a brand-new identity
    Starter,
    /// Paid purchase through the store
    Purchase,
    /// Balance carried over from an anonymous identity at sign-in
    Migration,
    /// Promotional or support credit
    Bonus,
    /// Returned credits for a failed action
    Refund,
}

/// Audit record for one credit grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub identity_key: String,
    pub amount: Credits,
    pub source: GrantSource,
    /// Credits on the record immediately after this grant
    pub balance_after: Credits,
    pub granted_at: DateTime<Utc>,
}
