//! Reconciliation engine - core consume, load, and migration logic
//!
//! The engine ties the identity resolver, the local cache, the remote
//! ledger, and the premium gate together. The ledger is authoritative
//! for every balance; the cache is the offline-readable projection the
//! UI reads synchronously. Every operation for one identity runs behind
//! a per-identity session lock, so a consume can never interleave with a
//! migration for the same balance.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use chrono::Utc;
use pixlift_identity::{Identity, IdentityResolver};

use crate::balance::{BalanceRecord, CreditGrant, Credits, GrantSource, QuotaLimit};
use crate::cache::BalanceCache;
use crate::error::{EntitlementError, EntitlementResult};
use crate::ledger::{ConsumeReceipt, RemoteLedger};
use crate::premium::{PremiumGate, SubscriptionStatus};
use crate::quota::QuotaClock;

// ==================== Configuration ====================

/// Reconciliation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Credits seeded into a brand-new identity's balance
    pub starter_credits: Credits,
    /// Daily free-action allowance for newly created records
    pub default_quota_limit: QuotaLimit,
    /// Minimum spacing between premium checks per identity
    pub premium_refresh_interval: Duration,
    /// Upper bound on any single remote ledger call
    pub remote_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            starter_credits: 10,
            default_quota_limit: QuotaLimit::Limited(25),
            premium_refresh_interval: Duration::from_secs(60),
            remote_timeout: Duration::from_secs(10),
        }
    }
}

// ==================== Sessions ====================

/// Lifecycle of one identity's balance session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No load has been attempted yet
    Uninitialized,
    /// A load is reconciling the cache with the ledger
    Loading,
    /// The balance is reconciled and serving reads
    Ready,
    /// An anonymous balance is being folded into an account
    Migrating,
}

struct Session {
    /// Serializes every engine operation for one identity
    lock: Mutex<()>,
    state: RwLock<SessionState>,
}

impl Session {
    fn new() -> Arc<Self> {
        Arc::new(Session {
            lock: Mutex::new(()),
            state: RwLock::new(SessionState::Uninitialized),
        })
    }

    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }
}

// ==================== Migration ====================

/// What an anonymous identity is owed at sign-in. Built once per
/// transition and consumed by exactly one migration attempt.
struct MigrationTicket {
    from: Identity,
    credits: Credits,
}

/// Outcome of folding an anonymous balance into an account
#[derive(Debug)]
pub struct MigrationReport {
    /// The authenticated identity now owning the session
    pub identity: Identity,
    /// Reconciled record for the authenticated identity
    pub record: BalanceRecord,
    /// Credits moved over from the anonymous balance
    pub migrated_credits: Credits,
    /// Set when the anonymous balance could not be transferred; the
    /// anonymous cache entry is kept so the amount stays inspectable
    pub incomplete: Option<EntitlementError>,
}

// ==================== Statistics ====================

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub sessions: usize,
    pub completed_migrations: u64,
    pub recorded_grants: usize,
}

// ==================== Engine ====================

/// Coordinates the local cache and the remote ledger for every identity.
///
/// All collaborators are injected, so tests run against in-memory
/// doubles and hosts choose their own storage and transport.
pub struct ReconciliationEngine {
    /// Configuration
    config: EngineConfig,
    /// Decides which identity owns the session
    resolver: Arc<IdentityResolver>,
    /// Device-local balance projection
    cache: Arc<dyn BalanceCache>,
    /// Authoritative balance service
    ledger: Arc<dyn RemoteLedger>,
    /// Source of the quota day
    clock: Arc<dyn QuotaClock>,
    /// Rate-limited premium state
    gate: PremiumGate,
    /// Per-identity sessions by storage key
    sessions: DashMap<String, Arc<Session>>,
    /// Grant audit log by storage key
    grants: DashMap<String, Vec<CreditGrant>>,
    /// Migrations that ran to completion
    completed_migrations: AtomicU64,
}

impl ReconciliationEngine {
    /// Creates an engine with default configuration.
    pub fn new(
        resolver: Arc<IdentityResolver>,
        cache: Arc<dyn BalanceCache>,
        ledger: Arc<dyn RemoteLedger>,
        status: Arc<dyn SubscriptionStatus>,
        clock: Arc<dyn QuotaClock>,
    ) -> Self {
        Self::with_config(EngineConfig::default(), resolver, cache, ledger, status, clock)
    }

    /// Creates an engine with custom configuration.
    pub fn with_config(
        config: EngineConfig,
        resolver: Arc<IdentityResolver>,
        cache: Arc<dyn BalanceCache>,
        ledger: Arc<dyn RemoteLedger>,
        status: Arc<dyn SubscriptionStatus>,
        clock: Arc<dyn QuotaClock>,
    ) -> Self {
        let gate = PremiumGate::new(status, config.premium_refresh_interval);
        ReconciliationEngine {
            config,
            resolver,
            cache,
            ledger,
            clock,
            gate,
            sessions: DashMap::new(),
            grants: DashMap::new(),
            completed_migrations: AtomicU64::new(0),
        }
    }

    // ==================== Identity & Sessions ====================

    /// The identity that currently owns the session.
    pub fn current_identity(&self) -> Identity {
        self.resolver.current()
    }

    /// Lifecycle state of `identity`'s balance session.
    pub fn session_state(&self, identity: &Identity) -> SessionState {
        self.sessions
            .get(&identity.storage_key())
            .map(|session| session.state())
            .unwrap_or(SessionState::Uninitialized)
    }

    fn session(&self, identity: &Identity) -> Arc<Session> {
        self.sessions
            .entry(identity.storage_key())
            .or_insert_with(Session::new)
            .clone()
    }

    fn forget_session(&self, identity: &Identity) {
        self.sessions.remove(&identity.storage_key());
        self.gate.invalidate(identity);
    }

    // ==================== Balance Reads ====================

    /// Last cached balance for `identity` with today's quota view.
    ///
    /// Never touches the network. Returns `None` for identities with no
    /// local record yet; callers show it as an untouched balance.
    pub fn balance(&self, identity: &Identity) -> EntitlementResult<Option<BalanceRecord>> {
        Ok(self
            .cache
            .load(identity)?
            .map(|record| self.clock.reset_if_needed(&record)))
    }

    /// True when a consume would plausibly succeed right now, judged
    /// from local state only. Premium short-circuits before any counter
    /// is looked at.
    pub fn can_consume(&self, identity: &Identity) -> bool {
        if self.gate.cached(identity) {
            return true;
        }
        match self.cache.load(identity) {
            Ok(Some(record)) => {
                let record = self.clock.reset_if_needed(&record);
                record.is_premium || record.can_consume()
            }
            _ => false,
        }
    }

    /// Grant audit entries for `identity`, newest first.
    pub fn grant_history(&self, identity: &Identity, limit: usize) -> Vec<CreditGrant> {
        self.grants
            .get(&identity.storage_key())
            .map(|grants| grants.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Engine-wide counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            sessions: self.sessions.len(),
            completed_migrations: self.completed_migrations.load(Ordering::Relaxed),
            recorded_grants: self.grants.iter().map(|entry| entry.value().len()).sum(),
        }
    }

    // ==================== Load Protocol ====================

    /// Reconciles `identity`'s balance with the remote ledger.
    ///
    /// The ledger wins whenever it answers. When it has no record, one
    /// is created: seeded from a positive local balance if the device
    /// has one, otherwise with the starter grant. When the ledger is
    /// unreachable the cached record (or a locally seeded starter
    /// record) keeps the device usable until the next successful load.
    ///
    /// # Errors
    ///
    /// Only local cache failures surface as errors; remote failures
    /// degrade to the cached balance.
    pub async fn load(&self, identity: &Identity) -> EntitlementResult<BalanceRecord> {
        let session = self.session(identity);
        let _guard = session.lock.lock().await;
        session.set_state(SessionState::Loading);
        let result = self.load_locked(identity).await;
        match &result {
            Ok(_) => session.set_state(SessionState::Ready),
            Err(_) => session.set_state(SessionState::Uninitialized),
        }
        result
    }

    async fn ensure_ready_locked(
        &self,
        identity: &Identity,
        session: &Session,
    ) -> EntitlementResult<()> {
        if session.state() == SessionState::Ready {
            return Ok(());
        }
        session.set_state(SessionState::Loading);
        match self.load_locked(identity).await {
            Ok(_) => {
                session.set_state(SessionState::Ready);
                Ok(())
            }
            Err(err) => {
                session.set_state(SessionState::Uninitialized);
                Err(err)
            }
        }
    }

    async fn load_locked(&self, identity: &Identity) -> EntitlementResult<BalanceRecord> {
        let cached = self.cache.load(identity)?;

        match self
            .with_timeout("fetch", self.ledger.fetch(identity))
            .await
        {
            Ok(Some(remote)) => {
                let remote = match self.validated(identity, remote) {
                    Ok(remote) => remote,
                    Err(err) => return self.offline_fallback(identity, cached, err),
                };
                let record = self.clock.reset_if_needed(&remote);
                self.cache.save(identity, &record)?;
                debug!(identity = %identity, credits = record.credits, "balance loaded from ledger");
                Ok(record)
            }
            Ok(None) => self.create_remote_locked(identity, cached).await,
            Err(err) if err.is_retryable() => self.offline_fallback(identity, cached, err),
            Err(err) => Err(err),
        }
    }

    /// Gate for every remote payload: a record violating its own
    /// invariants is treated as corruption and mapped to `Unavailable`,
    /// leaving the last known-good cached value in place.
    fn validated(
        &self,
        identity: &Identity,
        remote: BalanceRecord,
    ) -> EntitlementResult<BalanceRecord> {
        if remote.is_valid() {
            Ok(remote)
        } else {
            warn!(identity = %identity, "remote record violates invariants; ignoring it");
            Err(EntitlementError::unavailable(
                "remote record violates invariants",
            ))
        }
    }

    /// The ledger has never seen this identity: create its record,
    /// seeding from a positive local balance when the device has one.
    async fn create_remote_locked(
        &self,
        identity: &Identity,
        cached: Option<BalanceRecord>,
    ) -> EntitlementResult<BalanceRecord> {
        if let Some(local) = &cached {
            if local.credits == 0 {
                // Nothing worth uploading; the record will be created by
                // the next grant instead.
                let record = self.clock.reset_if_needed(local);
                self.cache.save(identity, &record)?;
                return Ok(record);
            }
        }

        let first_run = cached.is_none();
        let initial = cached
            .as_ref()
            .map(|local| local.credits)
            .unwrap_or(self.config.starter_credits);

        match self
            .with_timeout("create", self.ledger.create(identity, initial))
            .await
        {
            Ok(remote) => {
                let remote = match self.validated(identity, remote) {
                    Ok(remote) => remote,
                    Err(err) => return self.offline_fallback(identity, cached, err),
                };
                let record = self.clock.reset_if_needed(&remote);
                self.cache.save(identity, &record)?;
                if first_run {
                    self.record_grant(identity, initial, GrantSource::Starter, record.credits);
                }
                info!(identity = %identity, credits = record.credits, "created ledger record");
                Ok(record)
            }
            Err(EntitlementError::Conflict(_)) => {
                // Lost a create race; the winner's record is authoritative.
                let remote = self
                    .with_timeout("fetch", self.ledger.fetch(identity))
                    .await?
                    .ok_or_else(|| {
                        EntitlementError::unavailable("record vanished after create conflict")
                    })?;
                let remote = match self.validated(identity, remote) {
                    Ok(remote) => remote,
                    Err(err) => return self.offline_fallback(identity, cached, err),
                };
                let record = self.clock.reset_if_needed(&remote);
                self.cache.save(identity, &record)?;
                Ok(record)
            }
            Err(err) if err.is_retryable() => self.offline_fallback(identity, cached, err),
            Err(err) => Err(err),
        }
    }

    /// Keeps the device usable when the ledger cannot be reached: the
    /// cached record if one exists, otherwise a locally seeded starter
    /// record reconciled by the next successful load.
    fn offline_fallback(
        &self,
        identity: &Identity,
        cached: Option<BalanceRecord>,
        cause: EntitlementError,
    ) -> EntitlementResult<BalanceRecord> {
        match cached {
            Some(local) => {
                warn!(identity = %identity, error = %cause, "ledger unreachable; serving cached balance");
                let record = self.clock.reset_if_needed(&local);
                self.cache.save(identity, &record)?;
                Ok(record)
            }
            None => {
                warn!(identity = %identity, error = %cause, "ledger unreachable; seeding local starter balance");
                let record = BalanceRecord::new(
                    identity.storage_key(),
                    self.config.starter_credits,
                    self.config.default_quota_limit,
                    self.clock.today(),
                );
                self.cache.save(identity, &record)?;
                self.record_grant(
                    identity,
                    self.config.starter_credits,
                    GrantSource::Starter,
                    record.credits,
                );
                Ok(record)
            }
        }
    }

    // ==================== Consume Protocol ====================

    /// Consumes one paid action for `identity`.
    ///
    /// Premium identities bypass both counters. Otherwise the consume is
    /// a single ledger transaction taking one credit and one quota unit,
    /// and the cache is only written from the receipt the ledger
    /// returns. An unreachable ledger fails the consume with
    /// `Unavailable` and moves no counter anywhere; there is no
    /// optimistic local decrement to roll back.
    ///
    /// # Errors
    ///
    /// - `InsufficientCredits` when the paid balance is exhausted
    /// - `QuotaExceeded` when today's allowance is used up
    /// - `Unavailable` when the ledger cannot be reached in time
    pub async fn consume(&self, identity: &Identity) -> EntitlementResult<BalanceRecord> {
        let session = self.session(identity);
        let _guard = session.lock.lock().await;
        self.ensure_ready_locked(identity, &session).await?;

        let premium = self.gate.refresh(identity).await;

        if !premium {
            // Credits only ever grow through grants, which update the
            // cache, so a cached zero is trustworthy: refuse locally
            // without a ledger round-trip. Quota is not pre-checked
            // here; the ledger may have already rolled the day over.
            if let Some(cached) = self.cache.load(identity)? {
                if cached.credits == 0 && !cached.is_premium {
                    debug!(identity = %identity, "consume refused locally: no credits");
                    return Err(EntitlementError::InsufficientCredits { available: 0 });
                }
            }
        }

        let receipt = self
            .with_timeout("consume", self.ledger.consume_with_quota(identity, premium))
            .await?;
        let record = self.apply_receipt(identity, premium, receipt)?;
        debug!(
            identity = %identity,
            credits = record.credits,
            quota_used = record.quota_used,
            "consume committed"
        );
        Ok(record)
    }

    /// Overwrites the cache from an authoritative consume receipt.
    fn apply_receipt(
        &self,
        identity: &Identity,
        premium: bool,
        receipt: ConsumeReceipt,
    ) -> EntitlementResult<BalanceRecord> {
        if !receipt.is_valid() {
            warn!(identity = %identity, "consume receipt violates invariants; keeping cached balance");
            return Err(EntitlementError::unavailable(
                "consume receipt violates invariants",
            ));
        }
        let mut record = match self.cache.load(identity)? {
            Some(existing) => existing,
            None => BalanceRecord::new(
                identity.storage_key(),
                0,
                receipt.quota_limit,
                self.clock.today(),
            ),
        };
        record.credits = receipt.credits;
        record.quota_used = receipt.quota_used;
        record.quota_limit = receipt.quota_limit;
        record.quota_day = self.clock.today();
        record.is_premium = premium;
        record.updated_at = Utc::now();
        self.cache.save(identity, &record)?;
        Ok(record)
    }

    // ==================== Grants & Premium ====================

    /// Adds purchased or granted credits to `identity`.
    ///
    /// The grant is written to the ledger first and the cache is updated
    /// from the ledger's answer; an unreachable ledger fails the grant
    /// without touching local state. Zero-amount grants are a pure read:
    /// they return the current balance view without a ledger call, an
    /// audit entry, or a materialized record.
    pub async fn add_credits(
        &self,
        identity: &Identity,
        amount: Credits,
        source: GrantSource,
    ) -> EntitlementResult<BalanceRecord> {
        let session = self.session(identity);
        let _guard = session.lock.lock().await;

        if amount == 0 {
            return Ok(match self.cache.load(identity)? {
                Some(record) => self.clock.reset_if_needed(&record),
                None => BalanceRecord::new(
                    identity.storage_key(),
                    0,
                    self.config.default_quota_limit,
                    self.clock.today(),
                ),
            });
        }

        let remote = self
            .with_timeout("add_credits", self.ledger.add_credits(identity, amount, source))
            .await?;
        let remote = self.validated(identity, remote)?;
        let record = self.clock.reset_if_needed(&remote);
        self.cache.save(identity, &record)?;
        self.record_grant(identity, amount, source, record.credits);
        info!(
            identity = %identity,
            amount,
            source = ?source,
            credits = record.credits,
            "credits granted"
        );
        Ok(record)
    }

    fn record_grant(
        &self,
        identity: &Identity,
        amount: Credits,
        source: GrantSource,
        balance_after: Credits,
    ) {
        let grant = CreditGrant {
            identity_key: identity.storage_key(),
            amount,
            source,
            balance_after,
            granted_at: Utc::now(),
        };
        self.grants
            .entry(identity.storage_key())
            .or_default()
            .push(grant);
    }

    /// Refreshes the premium flag through the rate-limited gate and
    /// folds it into the cached record.
    pub async fn refresh_premium(&self, identity: &Identity) -> EntitlementResult<bool> {
        let session = self.session(identity);
        let _guard = session.lock.lock().await;
        let premium = self.gate.refresh(identity).await;
        if let Some(mut record) = self.cache.load(identity)? {
            if record.is_premium != premium {
                record.is_premium = premium;
                record.updated_at = Utc::now();
                self.cache.save(identity, &record)?;
            }
        }
        Ok(premium)
    }

    // ==================== Sign-in & Sign-out ====================

    /// Signs the session in and folds any anonymous balance into the
    /// account.
    ///
    /// Migration is additive on the ledger: the account keeps everything
    /// it already had plus the anonymous credits. It runs at most once
    /// per anonymous identity; repeated sign-ins with the same principal
    /// reconcile the account without another transfer. A transfer that
    /// cannot complete is reported in [`MigrationReport::incomplete`],
    /// never silently dropped, and the anonymous cache entry stays put
    /// for inspection.
    pub async fn on_authenticated(
        &self,
        principal_id: &str,
    ) -> EntitlementResult<MigrationReport> {
        let transition = self.resolver.on_authenticated(principal_id)?;
        let identity = transition.identity.clone();

        // Snapshot what the anonymous identity is owed. Taking its
        // session lock first lets an in-flight consume finish against
        // the old identity before the balance is read.
        let ticket = match &transition.previous_anonymous {
            Some(anon) => {
                let anon_session = self.session(anon);
                let _anon_guard = anon_session.lock.lock().await;
                let credits = self
                    .cache
                    .load(anon)?
                    .map(|record| record.credits)
                    .unwrap_or(0);
                Some(MigrationTicket {
                    from: anon.clone(),
                    credits,
                })
            }
            None => None,
        };

        let session = self.session(&identity);
        let _guard = session.lock.lock().await;
        session.set_state(if ticket.is_some() {
            SessionState::Migrating
        } else {
            SessionState::Loading
        });

        let result = self.migrate_locked(&identity, ticket).await;
        match &result {
            Ok(_) => session.set_state(SessionState::Ready),
            Err(_) => session.set_state(SessionState::Uninitialized),
        }
        result
    }

    async fn migrate_locked(
        &self,
        identity: &Identity,
        ticket: Option<MigrationTicket>,
    ) -> EntitlementResult<MigrationReport> {
        // Make sure the account record exists; brand-new accounts get
        // the starter grant here.
        let record = self.load_locked(identity).await?;

        let Some(ticket) = ticket else {
            return Ok(MigrationReport {
                identity: identity.clone(),
                record,
                migrated_credits: 0,
                incomplete: None,
            });
        };

        if ticket.credits == 0 {
            self.cache.clear(&ticket.from)?;
            self.forget_session(&ticket.from);
            self.completed_migrations.fetch_add(1, Ordering::Relaxed);
            info!(from = %ticket.from, to = %identity, "migration complete: nothing to transfer");
            return Ok(MigrationReport {
                identity: identity.clone(),
                record,
                migrated_credits: 0,
                incomplete: None,
            });
        }

        match self
            .with_timeout(
                "add_credits",
                self.ledger
                    .add_credits(identity, ticket.credits, GrantSource::Migration),
            )
            .await
            .and_then(|remote| self.validated(identity, remote))
        {
            Ok(remote) => {
                let record = self.clock.reset_if_needed(&remote);
                self.cache.save(identity, &record)?;
                self.record_grant(identity, ticket.credits, GrantSource::Migration, record.credits);
                self.cache.clear(&ticket.from)?;
                self.forget_session(&ticket.from);
                self.completed_migrations.fetch_add(1, Ordering::Relaxed);
                info!(
                    from = %ticket.from,
                    to = %identity,
                    credits = ticket.credits,
                    "anonymous balance migrated"
                );
                Ok(MigrationReport {
                    identity: identity.clone(),
                    record,
                    migrated_credits: ticket.credits,
                    incomplete: None,
                })
            }
            Err(err) => {
                warn!(
                    from = %ticket.from,
                    to = %identity,
                    credits = ticket.credits,
                    error = %err,
                    "migration transfer failed; anonymous balance retained locally"
                );
                Ok(MigrationReport {
                    identity: identity.clone(),
                    record,
                    migrated_credits: 0,
                    incomplete: Some(EntitlementError::MigrationIncomplete {
                        from: ticket.from.storage_key(),
                        lost: ticket.credits,
                    }),
                })
            }
        }
    }

    /// Signs the session out onto a fresh anonymous identity and primes
    /// its balance. The signed-out account's remote record is untouched
    /// and its cache entry is kept as a plain projection.
    pub async fn on_signed_out(&self) -> EntitlementResult<Identity> {
        let previous = self.resolver.current();
        let identity = self.resolver.on_signed_out()?;
        if identity == previous {
            return Ok(identity);
        }
        self.forget_session(&previous);
        self.load(&identity).await?;
        Ok(identity)
    }

    // ==================== Remote Call Guard ====================

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> EntitlementResult<T>
    where
        F: Future<Output = EntitlementResult<T>>,
    {
        match timeout(self.config.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = self.config.remote_timeout.as_millis() as u64,
                    "ledger call timed out"
                );
                Err(EntitlementError::Unavailable(format!(
                    "{} timed out",
                    operation
                )))
            }
        }
    }
}
