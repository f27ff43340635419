//! # Pixlift Entitlements
//!
//! Hybrid credit and quota reconciliation for the Pixlift editor.
//!
//! A balance lives in two places: the remote ledger, which is
//! authoritative, and a device-local cache the UI can read without a
//! network round-trip. The [`ReconciliationEngine`] keeps the two
//! consistent across anonymous use, sign-in, sign-out, offline spells,
//! and the daily free-quota rollover.
//!
//! ## Features
//!
//! - **Two identity modes**: anonymous device identities and
//!   authenticated accounts, with one-time balance migration at sign-in
//! - **Remote-authoritative spending**: a consume is a single ledger
//!   transaction taking one credit and one quota unit; the cache is only
//!   written from ledger receipts, never decremented optimistically
//! - **Daily free quota**: a per-day allowance that resets lazily on
//!   read, robust to device clock changes in either direction
//! - **Premium bypass**: subscribers skip both counters, checked through
//!   a rate-limited gate that keeps last-known state when the
//!   subscription service is down
//! - **Offline-first reads**: balance reads never touch the network, and
//!   loads degrade to the cached record when the ledger is unreachable
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pixlift_entitlements::{
//!     EntitlementResult, MemoryCache, MemoryLedger, QuotaLimit, ReconciliationEngine,
//!     StaticSubscriptionStatus, SystemQuotaClock,
//! };
//! use pixlift_identity::{IdentityResolver, MemoryIdentityStore};
//!
//! async fn example() -> EntitlementResult<()> {
//!     let clock = Arc::new(SystemQuotaClock);
//!     let resolver = Arc::new(IdentityResolver::new(Arc::new(MemoryIdentityStore::new()))?);
//!     let engine = ReconciliationEngine::new(
//!         resolver,
//!         Arc::new(MemoryCache::new()),
//!         Arc::new(MemoryLedger::new(clock.clone(), QuotaLimit::Limited(25))),
//!         Arc::new(StaticSubscriptionStatus::new()),
//!         clock,
//!     );
//!
//!     // First load seeds the starter balance and creates the ledger record.
//!     let identity = engine.current_identity();
//!     let balance = engine.load(&identity).await?;
//!     assert_eq!(balance.credits, 10);
//!
//!     // Each edit takes one credit and one unit of today's quota.
//!     let balance = engine.consume(&identity).await?;
//!     assert_eq!(balance.credits, 9);
//!     assert_eq!(balance.quota_used, 1);
//!     Ok(())
//! }
//! ```

pub mod balance;
pub mod cache;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod premium;
pub mod quota;

pub use balance::*;
pub use cache::*;
pub use engine::*;
pub use error::*;
pub use ledger::*;
pub use premium::*;
pub use quota::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
