//! Error types for the ledger

use crate::id::{IdError, Identifier};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Ledger errors
///
/// An idempotent replay is not an error: it is reported as
/// [`crate::Outcome::Replayed`].
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed input, rejected before touching the store
    #[error("Validation error: {0}")]
    Validation(String),

    /// Identifier could not be parsed or failed validation
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(IdError),

    /// Conditional debit matched no row
    #[error("Insufficient funds on account {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Account that would have gone negative
        account: Identifier,
        /// Amount requested
        requested: Decimal,
        /// Balance observed under the row lock
        available: Decimal,
    },

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(Identifier),

    /// User not found
    #[error("User not found: {0}")]
    UserNotFound(Identifier),

    /// Serialization failure or deadlock reported by the store (retryable)
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// Statement or transaction timeout
    #[error("Store timeout: {0}")]
    Timeout(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entropy exhaustion, broken invariants, anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the boundary layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client sent something malformed
    Validation,
    /// Balance too low
    InsufficientFunds,
    /// Referenced entity absent
    NotFound,
    /// Everything else
    Internal,
}

impl LedgerError {
    /// Whether the failed unit may be re-run from scratch
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }

    /// Classify for response mapping
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) | LedgerError::InvalidIdentifier(_) => ErrorKind::Validation,
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::AccountNotFound(_) | LedgerError::UserNotFound(_) => ErrorKind::NotFound,
            LedgerError::Conflict(_)
            | LedgerError::Timeout(_)
            | LedgerError::Database(_)
            | LedgerError::Metrics(_)
            | LedgerError::Config(_)
            | LedgerError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<IdError> for LedgerError {
    fn from(err: IdError) -> Self {
        match err {
            IdError::Entropy(msg) => LedgerError::Internal(format!("identifier entropy: {}", msg)),
            other => LedgerError::InvalidIdentifier(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_failure_is_internal() {
        let err: LedgerError = IdError::Entropy("no randomness".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_malformed_identifier_is_validation() {
        let err: LedgerError = IdError::Malformed("bad length".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_only_conflicts_retry() {
        assert!(LedgerError::Conflict("40001".into()).is_retryable());
        assert!(!LedgerError::Timeout("57014".into()).is_retryable());
        assert!(!LedgerError::Validation("x".into()).is_retryable());
    }
}
