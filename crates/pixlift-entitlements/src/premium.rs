//! Premium subscription gating
//!
//! Subscription state lives in a separate service and is eventually
//! consistent; a lapsed subscription may keep bypassing counters for one
//! refresh interval, which is acceptable for this product. The gate
//! caches the last answer per identity and consults the collaborator at
//! most once per interval, so consume paths never stack up behind a slow
//! subscription check.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use pixlift_identity::Identity;

use crate::error::EntitlementResult;

/// Source of truth for premium subscription state
#[async_trait]
pub trait SubscriptionStatus: Send + Sync {
    /// Whether `identity` currently holds an active premium subscription.
    async fn is_active(&self, identity: &Identity) -> EntitlementResult<bool>;
}

/// Fixed premium set for tests and local development
#[derive(Default)]
pub struct StaticSubscriptionStatus {
    premium_keys: DashMap<String, bool>,
}

impl StaticSubscriptionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks or unmarks an identity as premium.
    pub fn set_premium(&self, identity: &Identity, active: bool) {
        self.premium_keys.insert(identity.storage_key(), active);
    }
}

#[async_trait]
impl SubscriptionStatus for StaticSubscriptionStatus {
    async fn is_active(&self, identity: &Identity) -> EntitlementResult<bool> {
        Ok(self
            .premium_keys
            .get(&identity.storage_key())
            .map(|active| *active)
            .unwrap_or(false))
    }
}

struct GateEntry {
    premium: bool,
    checked_at: Instant,
}

/// Caching, rate-limited view of subscription state.
///
/// Unknown identities are treated as non-premium until a refresh says
/// otherwise. Collaborator failures keep the last known answer and still
/// stamp the entry, so a flapping backend is queried once per interval,
/// not once per consume.
pub struct PremiumGate {
    status: Arc<dyn SubscriptionStatus>,
    refresh_interval: Duration,
    entries: DashMap<String, GateEntry>,
}

impl PremiumGate {
    pub fn new(status: Arc<dyn SubscriptionStatus>, refresh_interval: Duration) -> Self {
        PremiumGate {
            status,
            refresh_interval,
            entries: DashMap::new(),
        }
    }

    /// Last known premium state without touching the collaborator.
    pub fn cached(&self, identity: &Identity) -> bool {
        self.entries
            .get(&identity.storage_key())
            .map(|entry| entry.premium)
            .unwrap_or(false)
    }

    /// Returns the premium state, consulting the collaborator at most
    /// once per refresh interval per identity.
    pub async fn refresh(&self, identity: &Identity) -> bool {
        let key = identity.storage_key();
        if let Some(entry) = self.entries.get(&key) {
            if entry.checked_at.elapsed() < self.refresh_interval {
                return entry.premium;
            }
        }

        let previous = self.cached(identity);
        let premium = match self.status.is_active(identity).await {
            Ok(active) => active,
            Err(err) => {
                warn!(
                    identity = %identity,
                    error = %err,
                    "premium check failed; keeping last known state"
                );
                previous
            }
        };

        self.entries.insert(
            key,
            GateEntry {
                premium,
                checked_at: Instant::now(),
            },
        );
        if premium != previous {
            debug!(identity = %identity, premium, "premium state changed");
        }
        premium
    }

    /// Drops the cached state so the next refresh asks the collaborator.
    pub fn invalidate(&self, identity: &Identity) {
        self.entries.remove(&identity.storage_key());
    }
}
