//! Resolution of the current identity and its lifecycle transitions

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::identity::{generate_device_id, AuthTransition, Identity};
use crate::store::{IdentityStore, PersistedIdentity};
use crate::IdentityResult;

/// Decides which identity owns the session and persists transitions.
///
/// The resolver is the single writer of the identity document. It only
/// hands out [`Identity`] values; balance state lives elsewhere, keyed
/// by [`Identity::storage_key`].
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    state: RwLock<PersistedIdentity>,
}

impl IdentityResolver {
    /// Loads the persisted identity, generating and persisting a fresh
    /// device id on first run.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be read or the first-run
    /// document cannot be written.
    pub fn new(store: Arc<dyn IdentityStore>) -> IdentityResult<Self> {
        let state = match store.load()? {
            Some(state) => state,
            None => {
                let state = PersistedIdentity::new(generate_device_id());
                store.save(&state)?;
                info!(device_id = %state.device_id, "generated first-run device identity");
                state
            }
        };
        Ok(IdentityResolver {
            store,
            state: RwLock::new(state),
        })
    }

    /// The identity that currently owns the session.
    pub fn current(&self) -> Identity {
        let state = self.state.read();
        match &state.principal_id {
            Some(principal_id) => Identity::Authenticated {
                principal_id: principal_id.clone(),
            },
            None => Identity::Anonymous {
                device_id: state.device_id.clone(),
            },
        }
    }

    /// Device id of the current (or dormant) anonymous identity.
    pub fn device_id(&self) -> String {
        self.state.read().device_id.clone()
    }

    /// Records a sign-in and reports the transition.
    ///
    /// `previous_anonymous` is `Some` only when this call performed the
    /// anonymous-to-authenticated transition. Repeating the call with the
    /// same principal is a persisted no-op. A sign-in for a *different*
    /// principal while already authenticated switches accounts without a
    /// migration source; anonymous balances are the only thing a
    /// transition can carry.
    pub fn on_authenticated(&self, principal_id: &str) -> IdentityResult<AuthTransition> {
        let mut state = self.state.write();
        let identity = Identity::Authenticated {
            principal_id: principal_id.to_string(),
        };

        let previous_anonymous = match state.principal_id.as_deref() {
            None => Some(Identity::Anonymous {
                device_id: state.device_id.clone(),
            }),
            Some(current) if current == principal_id => None,
            Some(current) => {
                warn!(
                    from = %current,
                    to = %principal_id,
                    "principal switch without sign-out"
                );
                None
            }
        };

        if state.principal_id.as_deref() != Some(principal_id) {
            state.principal_id = Some(principal_id.to_string());
            state.updated_at = Utc::now();
            self.store.save(&state)?;
            info!(identity = %identity, "signed in");
        }

        Ok(AuthTransition {
            identity,
            previous_anonymous,
        })
    }

    /// Records a sign-out.
    ///
    /// The previous device id is abandoned; a fresh anonymous identity
    /// takes over and is persisted. Calling this while already anonymous
    /// keeps the current identity.
    pub fn on_signed_out(&self) -> IdentityResult<Identity> {
        let mut state = self.state.write();
        if state.principal_id.is_none() {
            return Ok(Identity::Anonymous {
                device_id: state.device_id.clone(),
            });
        }

        let abandoned = std::mem::replace(&mut state.device_id, generate_device_id());
        state.principal_id = None;
        state.updated_at = Utc::now();
        self.store.save(&state)?;
        info!(
            abandoned_device_id = %abandoned,
            device_id = %state.device_id,
            "signed out onto fresh anonymous identity"
        );

        Ok(Identity::Anonymous {
            device_id: state.device_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIdentityStore;

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(MemoryIdentityStore::new())).unwrap()
    }

    #[test]
    fn test_first_run_generates_and_persists_device_id() {
        let store = Arc::new(MemoryIdentityStore::new());
        let resolver = IdentityResolver::new(store.clone()).unwrap();
        let device_id = resolver.device_id();
        assert!(!device_id.is_empty());

        // A resolver built over the same store sees the same identity.
        let reloaded = IdentityResolver::new(store).unwrap();
        assert_eq!(reloaded.device_id(), device_id);
        assert_eq!(reloaded.current(), resolver.current());
    }

    #[test]
    fn test_sign_in_reports_previous_anonymous_once() {
        let resolver = resolver();
        let anon = resolver.current();
        assert!(anon.is_anonymous());

        let first = resolver.on_authenticated("user-1").unwrap();
        assert_eq!(
            first.identity,
            Identity::Authenticated {
                principal_id: "user-1".to_string()
            }
        );
        assert_eq!(first.previous_anonymous, Some(anon));

        let second = resolver.on_authenticated("user-1").unwrap();
        assert_eq!(second.identity, first.identity);
        assert_eq!(second.previous_anonymous, None);
    }

    #[test]
    fn test_principal_switch_has_no_migration_source() {
        let resolver = resolver();
        resolver.on_authenticated("user-1").unwrap();
        let switched = resolver.on_authenticated("user-2").unwrap();
        assert_eq!(
            switched.identity,
            Identity::Authenticated {
                principal_id: "user-2".to_string()
            }
        );
        assert_eq!(switched.previous_anonymous, None);
    }

    #[test]
    fn test_sign_out_creates_fresh_anonymous_identity() {
        let resolver = resolver();
        let original_device = resolver.device_id();
        resolver.on_authenticated("user-1").unwrap();

        let anon = resolver.on_signed_out().unwrap();
        assert!(anon.is_anonymous());
        assert_ne!(resolver.device_id(), original_device);
        assert_eq!(resolver.current(), anon);
    }

    #[test]
    fn test_sign_out_while_anonymous_is_a_no_op() {
        let resolver = resolver();
        let before = resolver.current();
        let after = resolver.on_signed_out().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_transitions_survive_reload() {
        let store = Arc::new(MemoryIdentityStore::new());
        {
            let resolver = IdentityResolver::new(store.clone()).unwrap();
            resolver.on_authenticated("user-9").unwrap();
        }
        let reloaded = IdentityResolver::new(store).unwrap();
        assert_eq!(
            reloaded.current(),
            Identity::Authenticated {
                principal_id: "user-9".to_string()
            }
        );
    }
}
