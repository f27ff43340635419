//! Identity resolution for the pixlift credit system
//!
//! Every credit balance belongs to exactly one identity: an anonymous
//! device installation or an authenticated account. This crate decides
//! which identity owns the current session, persists that decision, and
//! reports the transitions the balance layer needs in order to migrate
//! credits:
//! - Stable anonymous device ids, generated once and persisted
//! - Single-shot anonymous-to-authenticated transition reporting
//! - Fresh anonymous identity on sign-out (the old one is never restored)
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use pixlift_identity::{IdentityResolver, MemoryIdentityStore};
//!
//! fn example() -> Result<(), pixlift_identity::IdentityError> {
//!     let resolver = IdentityResolver::new(Arc::new(MemoryIdentityStore::new()))?;
//!     let anon = resolver.current();
//!     assert!(anon.is_anonymous());
//!
//!     // First sign-in reports the anonymous identity it replaces.
//!     let transition = resolver.on_authenticated("user-42")?;
//!     assert_eq!(transition.previous_anonymous, Some(anon));
//!
//!     // Repeating it does not.
//!     let again = resolver.on_authenticated("user-42")?;
//!     assert_eq!(again.previous_anonymous, None);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

pub mod identity;
pub mod resolver;
pub mod store;

pub use identity::{generate_device_id, AuthTransition, Identity};
pub use resolver::IdentityResolver;
pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore, PersistedIdentity};

use thiserror::Error;

/// Result type for identity operations
pub type IdentityResult<T> = std::result::Result<T, IdentityError>;

/// Errors that can occur while resolving or persisting identities
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Identity serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for IdentityError {
    fn from(err: serde_json::Error) -> Self {
        IdentityError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IdentityError::Serialization("bad document".to_string());
        assert_eq!(err.to_string(), "Identity serialization error: bad document");
    }
}
