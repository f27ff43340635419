//! Identity variants and their storage keys

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a fresh device id (UUID v4)
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string()
}

/// An identity that owns a credit balance.
///
/// Exactly one variant is active for a session at any time. The only
/// legal transition is `Anonymous` to `Authenticated` (sign-in); signing
/// out produces a brand-new `Anonymous` identity rather than restoring
/// the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// Device-scoped identity used before sign-in
    Anonymous { device_id: String },
    /// Account-scoped identity used after sign-in
    Authenticated { principal_id: String },
}

impl Identity {
    /// Creates an anonymous identity with a freshly generated device id.
    pub fn new_anonymous() -> Self {
        Identity::Anonymous {
            device_id: generate_device_id(),
        }
    }

    /// Stable key under which this identity's balance is stored.
    ///
    /// Anonymous and authenticated identities live in disjoint key
    /// spaces, so a device id can never collide with a principal id.
    pub fn storage_key(&self) -> String {
        match self {
            Identity::Anonymous { device_id } => format!("anon:{}", device_id),
            Identity::Authenticated { principal_id } => format!("acct:{}", principal_id),
        }
    }

    /// True for the anonymous variant.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous { .. })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Outcome of a sign-in, as reported by the resolver.
///
/// `previous_anonymous` is populated exactly once per anonymous-to-
/// authenticated transition. Repeated sign-ins with the same principal
/// report `None`, which keeps balance migration single-shot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTransition {
    /// The identity now owning the session
    pub identity: Identity,
    /// The anonymous identity this sign-in replaced, if any
    pub previous_anonymous: Option<Identity>,
}
