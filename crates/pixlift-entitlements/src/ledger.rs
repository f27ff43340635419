//! Remote ledger client interface
//!
//! The ledger is the authority for every balance. Writes happen there
//! first and the local cache is updated only from what the ledger
//! returns. `consume_with_quota` is a single server-side transaction:
//! callers never decrement credits and bump quota as two separate steps.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pixlift_identity::Identity;

use crate::balance::{BalanceRecord, Credits, GrantSource, QuotaLimit};
use crate::error::{EntitlementError, EntitlementResult};
use crate::quota::QuotaClock;

/// Authoritative post-consume counters returned by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeReceipt {
    /// Credits remaining after the consume
    pub credits: Credits,
    /// Quota consumed today after the consume
    pub quota_used: u32,
    /// Allowance the quota was checked against
    pub quota_limit: QuotaLimit,
}

impl ConsumeReceipt {
    /// True when the counters satisfy record invariants. Receipts that
    /// fail this check are treated as corrupt and never reach the cache.
    pub fn is_valid(&self) -> bool {
        match self.quota_limit {
            QuotaLimit::Limited(limit) => limit > 0,
            QuotaLimit::Unlimited => true,
        }
    }
}

/// Client interface to the authoritative balance service
#[async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Fetches the record for `identity`, or `None` if it was never
    /// created.
    async fn fetch(&self, identity: &Identity) -> EntitlementResult<Option<BalanceRecord>>;

    /// Creates the record for `identity` with an opening balance.
    ///
    /// # Errors
    ///
    /// `Conflict` when a record already exists; the caller should fetch
    /// the winner instead of retrying the create.
    async fn create(
        &self,
        identity: &Identity,
        initial_credits: Credits,
    ) -> EntitlementResult<BalanceRecord>;

    /// Performs one atomic consume.
    ///
    /// Premium consumes always succeed and leave every counter where it
    /// was. Otherwise the consume takes one credit *and* one quota unit
    /// in a single transaction, or fails without moving either.
    async fn consume_with_quota(
        &self,
        identity: &Identity,
        is_premium: bool,
    ) -> EntitlementResult<ConsumeReceipt>;

    /// Adds credits to `identity`, creating the record if absent.
    ///
    /// Strictly additive, so concurrent grants and consumes interleave
    /// without overwriting each other.
    async fn add_credits(
        &self,
        identity: &Identity,
        amount: Credits,
        source: GrantSource,
    ) -> EntitlementResult<BalanceRecord>;
}

/// In-memory ledger with the same transactional behavior as the real
/// service.
///
/// Used as the local development backend and as the substrate for test
/// doubles. Day rollover is applied lazily inside each operation with
/// the injected clock, mirroring how the service normalizes quota days
/// before deciding.
pub struct MemoryLedger {
    records: DashMap<String, BalanceRecord>,
    clock: Arc<dyn QuotaClock>,
    default_quota_limit: QuotaLimit,
}

impl MemoryLedger {
    pub fn new(clock: Arc<dyn QuotaClock>, default_quota_limit: QuotaLimit) -> Self {
        MemoryLedger {
            records: DashMap::new(),
            clock,
            default_quota_limit,
        }
    }

    /// Marks an identity premium on the service side (admin surface).
    pub fn set_premium(&self, identity: &Identity, is_premium: bool) {
        let key = identity.storage_key();
        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| {
                BalanceRecord::new(key, 0, self.default_quota_limit, self.clock.today())
            });
        entry.is_premium = is_premium;
        entry.updated_at = Utc::now();
    }

    /// Replaces an identity's quota allowance (admin surface).
    pub fn set_quota_limit(&self, identity: &Identity, limit: QuotaLimit) {
        let key = identity.storage_key();
        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| {
                BalanceRecord::new(key, 0, self.default_quota_limit, self.clock.today())
            });
        entry.quota_limit = limit;
        entry.updated_at = Utc::now();
    }

    /// Installs a record verbatim, keyed by its `identity_key` (test and
    /// admin surface).
    pub fn upsert(&self, record: BalanceRecord) {
        self.records.insert(record.identity_key.clone(), record);
    }

    fn normalize_day(&self, record: &mut BalanceRecord) {
        let today = self.clock.today();
        if record.quota_day != today {
            record.quota_used = 0;
            record.quota_day = today;
        }
    }
}

#[async_trait]
impl RemoteLedger for MemoryLedger {
    async fn fetch(&self, identity: &Identity) -> EntitlementResult<Option<BalanceRecord>> {
        let key = identity.storage_key();
        match self.records.get_mut(&key) {
            Some(mut entry) => {
                self.normalize_day(&mut entry);
                Ok(Some(entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        identity: &Identity,
        initial_credits: Credits,
    ) -> EntitlementResult<BalanceRecord> {
        let key = identity.storage_key();
        match self.records.entry(key.clone()) {
            Entry::Occupied(_) => Err(EntitlementError::Conflict(format!(
                "record already exists for {}",
                key
            ))),
            Entry::Vacant(slot) => {
                let record = BalanceRecord::new(
                    key,
                    initial_credits,
                    self.default_quota_limit,
                    self.clock.today(),
                );
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn consume_with_quota(
        &self,
        identity: &Identity,
        is_premium: bool,
    ) -> EntitlementResult<ConsumeReceipt> {
        let key = identity.storage_key();
        if is_premium {
            // Premium consumes succeed even before any record exists;
            // materialize one lazily the way grants do.
            let mut entry = self
                .records
                .entry(key.clone())
                .or_insert_with(|| {
                    BalanceRecord::new(key, 0, self.default_quota_limit, self.clock.today())
                });
            self.normalize_day(&mut entry);
            return Ok(ConsumeReceipt {
                credits: entry.credits,
                quota_used: entry.quota_used,
                quota_limit: entry.quota_limit,
            });
        }

        let mut entry = self
            .records
            .get_mut(&key)
            .ok_or(EntitlementError::InsufficientCredits { available: 0 })?;
        self.normalize_day(&mut entry);

        if entry.is_premium {
            return Ok(ConsumeReceipt {
                credits: entry.credits,
                quota_used: entry.quota_used,
                quota_limit: entry.quota_limit,
            });
        }

        if entry.credits == 0 {
            return Err(EntitlementError::InsufficientCredits { available: 0 });
        }
        if let QuotaLimit::Limited(limit) = entry.quota_limit {
            if entry.quota_used >= limit {
                return Err(EntitlementError::QuotaExceeded {
                    used: entry.quota_used,
                    limit,
                });
            }
        }

        entry.credits -= 1;
        entry.quota_used += 1;
        entry.updated_at = Utc::now();
        Ok(ConsumeReceipt {
            credits: entry.credits,
            quota_used: entry.quota_used,
            quota_limit: entry.quota_limit,
        })
    }

    async fn add_credits(
        &self,
        identity: &Identity,
        amount: Credits,
        source: GrantSource,
    ) -> EntitlementResult<BalanceRecord> {
        let key = identity.storage_key();
        let mut entry = self
            .records
            .entry(key.clone())
            .or_insert_with(|| {
                BalanceRecord::new(key, 0, self.default_quota_limit, self.clock.today())
            });
        self.normalize_day(&mut entry);
        entry.add_credits(amount);
        debug!(identity = %identity, amount, source = ?source, "ledger grant applied");
        Ok(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::FixedQuotaClock;
    use chrono::NaiveDate;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn ledger_with_clock() -> (MemoryLedger, Arc<FixedQuotaClock>) {
        let clock = Arc::new(FixedQuotaClock::new(day("2024-06-01")));
        let ledger = MemoryLedger::new(clock.clone(), QuotaLimit::Limited(5));
        (ledger, clock)
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();

        let record = ledger.create(&identity, 10).await.unwrap();
        assert_eq!(record.credits, 10);
        assert_eq!(record.quota_used, 0);

        let err = ledger.create(&identity, 99).await.unwrap_err();
        assert!(matches!(err, EntitlementError::Conflict(_)));
        // The original record is untouched by the losing create.
        assert_eq!(ledger.fetch(&identity).await.unwrap().unwrap().credits, 10);
    }

    #[tokio::test]
    async fn test_fetch_unknown_identity() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        assert!(ledger.fetch(&identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_consume_moves_both_counters_atomically() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        ledger.create(&identity, 3).await.unwrap();

        let receipt = ledger.consume_with_quota(&identity, false).await.unwrap();
        assert_eq!(receipt.credits, 2);
        assert_eq!(receipt.quota_used, 1);

        let record = ledger.fetch(&identity).await.unwrap().unwrap();
        assert_eq!(record.credits, 2);
        assert_eq!(record.quota_used, 1);
    }

    #[tokio::test]
    async fn test_consume_requires_credits() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        ledger.create(&identity, 0).await.unwrap();

        let err = ledger.consume_with_quota(&identity, false).await.unwrap_err();
        assert!(matches!(
            err,
            EntitlementError::InsufficientCredits { available: 0 }
        ));
    }

    #[tokio::test]
    async fn test_consume_missing_record_reports_no_credits() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        let err = ledger.consume_with_quota(&identity, false).await.unwrap_err();
        assert!(matches!(
            err,
            EntitlementError::InsufficientCredits { available: 0 }
        ));
    }

    #[tokio::test]
    async fn test_quota_gate_holds_even_with_credits_left() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        // credits = 3, quota_used = 4 of 5: one consume fits, then the
        // quota refuses despite credits remaining.
        let mut record = BalanceRecord::new(
            identity.storage_key(),
            3,
            QuotaLimit::Limited(5),
            day("2024-06-01"),
        );
        record.quota_used = 4;
        ledger.upsert(record);

        let receipt = ledger.consume_with_quota(&identity, false).await.unwrap();
        assert_eq!(receipt.credits, 2);
        assert_eq!(receipt.quota_used, 5);

        let err = ledger.consume_with_quota(&identity, false).await.unwrap_err();
        assert!(matches!(
            err,
            EntitlementError::QuotaExceeded { used: 5, limit: 5 }
        ));
        // The failed consume moved nothing.
        let record = ledger.fetch(&identity).await.unwrap().unwrap();
        assert_eq!(record.credits, 2);
        assert_eq!(record.quota_used, 5);
    }

    #[tokio::test]
    async fn test_premium_consume_leaves_counters_alone() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        ledger.create(&identity, 0).await.unwrap();

        // Premium asserted by the caller.
        let receipt = ledger.consume_with_quota(&identity, true).await.unwrap();
        assert_eq!(receipt.credits, 0);
        assert_eq!(receipt.quota_used, 0);

        // Premium known on the service side.
        ledger.set_premium(&identity, true);
        let receipt = ledger.consume_with_quota(&identity, false).await.unwrap();
        assert_eq!(receipt.credits, 0);
        assert_eq!(receipt.quota_used, 0);
    }

    #[tokio::test]
    async fn test_premium_consume_succeeds_before_any_record_exists() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();

        let receipt = ledger.consume_with_quota(&identity, true).await.unwrap();
        assert_eq!(receipt.credits, 0);
        assert_eq!(receipt.quota_used, 0);

        // The record was materialized with nothing consumed from it.
        let record = ledger.fetch(&identity).await.unwrap().unwrap();
        assert_eq!(record.credits, 0);
        assert_eq!(record.quota_used, 0);
    }

    #[tokio::test]
    async fn test_unlimited_quota_never_exhausts() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        ledger.create(&identity, 50).await.unwrap();
        ledger.set_quota_limit(&identity, QuotaLimit::Unlimited);

        for expected_used in 1..=30 {
            let receipt = ledger.consume_with_quota(&identity, false).await.unwrap();
            assert_eq!(receipt.quota_used, expected_used);
        }
        assert_eq!(
            ledger.fetch(&identity).await.unwrap().unwrap().credits,
            20
        );
    }

    #[tokio::test]
    async fn test_add_credits_is_additive_and_lazily_creates() {
        let (ledger, _clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();

        let record = ledger
            .add_credits(&identity, 7, GrantSource::Migration)
            .await
            .unwrap();
        assert_eq!(record.credits, 7);

        let record = ledger
            .add_credits(&identity, 5, GrantSource::Purchase)
            .await
            .unwrap();
        assert_eq!(record.credits, 12);
    }

    #[tokio::test]
    async fn test_day_rollover_is_applied_before_deciding() {
        let (ledger, clock) = ledger_with_clock();
        let identity = Identity::new_anonymous();
        ledger.create(&identity, 10).await.unwrap();

        for _ in 0..5 {
            ledger.consume_with_quota(&identity, false).await.unwrap();
        }
        let err = ledger.consume_with_quota(&identity, false).await.unwrap_err();
        assert!(matches!(err, EntitlementError::QuotaExceeded { .. }));

        clock.advance_days(1);
        let receipt = ledger.consume_with_quota(&identity, false).await.unwrap();
        assert_eq!(receipt.quota_used, 1);
        assert_eq!(receipt.credits, 4);

        let record = ledger.fetch(&identity).await.unwrap().unwrap();
        assert_eq!(record.quota_day, clock.today());
    }

    #[tokio::test]
    async fn test_concurrent_consumes_spend_each_credit_once() {
        let (ledger, _clock) = ledger_with_clock();
        let ledger = Arc::new(ledger);
        let identity = Identity::new_anonymous();
        ledger.create(&identity, 1).await.unwrap();

        let (a, b) = tokio::join!(
            ledger.consume_with_quota(&identity, false),
            ledger.consume_with_quota(&identity, false)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

        let record = ledger.fetch(&identity).await.unwrap().unwrap();
        assert_eq!(record.credits, 0);
        assert_eq!(record.quota_used, 1);
    }
}
