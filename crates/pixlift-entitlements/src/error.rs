//! Error types for the entitlement system

use thiserror::Error;

use pixlift_identity::IdentityError;

/// Entitlement system errors
#[derive(Error, Debug)]
pub enum EntitlementError {
    #[error("Insufficient credits: available {available}")]
    InsufficientCredits { available: u64 },

    #[error("Daily quota exceeded: used {used} of {limit}")]
    QuotaExceeded { used: u32, limit: u32 },

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Migration incomplete: {lost} credits from {from} were not transferred")]
    MigrationIncomplete { from: String, lost: u64 },

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for entitlement operations
pub type EntitlementResult<T> = Result<T, EntitlementError>;

impl EntitlementError {
    /// Builds an `Unavailable` error from any displayable cause.
    pub fn unavailable(cause: impl std::fmt::Display) -> Self {
        EntitlementError::Unavailable(cause.to_string())
    }

    /// True for transient failures a caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EntitlementError::Unavailable(_) | EntitlementError::Conflict(_)
        )
    }
}

impl From<serde_json::Error> for EntitlementError {
    fn from(err: serde_json::Error) -> Self {
        EntitlementError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EntitlementError::QuotaExceeded { used: 25, limit: 25 };
        assert_eq!(err.to_string(), "Daily quota exceeded: used 25 of 25");

        let err = EntitlementError::InsufficientCredits { available: 0 };
        assert_eq!(err.to_string(), "Insufficient credits: available 0");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EntitlementError::unavailable("timeout").is_retryable());
        assert!(EntitlementError::Conflict("record exists".to_string()).is_retryable());
        assert!(!EntitlementError::InsufficientCredits { available: 0 }.is_retryable());
        assert!(!EntitlementError::QuotaExceeded { used: 5, limit: 5 }.is_retryable());
    }
}
