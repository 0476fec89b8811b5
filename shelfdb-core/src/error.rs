//! Core error types.

use crate::model::{CopyId, LoanId};
use thiserror::Error;

/// Errors from the catalog and ledger store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("copy not found: {copy_id}")]
    CopyNotFound { copy_id: CopyId },

    #[error("loan not found: {loan_id}")]
    LoanNotFound { loan_id: LoanId },

    #[error("copy already exists: {copy_id}")]
    CopyExists { copy_id: CopyId },

    #[error("timed out waiting for the lock on copy {copy_id}")]
    LockTimeout { copy_id: CopyId },

    #[error("constraint violation: {reason}")]
    ConstraintViolation { reason: String },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("corrupt log entry at sequence {sequence}: {reason}")]
    CorruptEntry { sequence: u64, reason: String },

    #[error("WAL error: {0}")]
    Wal(#[from] shelfdb_wal::WalError),
}

impl StoreError {
    /// Returns whether the operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::LockTimeout { .. } => true,
            StoreError::Wal(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns a stable error code for display and scripting.
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::CopyNotFound { .. } => "COPY_NOT_FOUND",
            StoreError::LoanNotFound { .. } => "LOAN_NOT_FOUND",
            StoreError::CopyExists { .. } => "COPY_EXISTS",
            StoreError::LockTimeout { .. } => "LOCK_TIMEOUT",
            StoreError::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            StoreError::InvalidInput { .. } => "BAD_REQUEST",
            StoreError::CorruptEntry { .. } => "CORRUPT_LOG",
            StoreError::Wal(e) => e.error_code(),
        }
    }
}

/// Errors returned by circulation operations.
#[derive(Debug, Error)]
pub enum CirculationError {
    #[error("copy not found: {copy_id}")]
    NotFound { copy_id: CopyId },

    #[error("copy {copy_id} is already issued")]
    AlreadyIssued { copy_id: CopyId },

    #[error("copy {copy_id} has no active loan")]
    NoActiveLoan { copy_id: CopyId },

    #[error("transaction failed after {attempts} attempt(s): {source}")]
    TransactionFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl CirculationError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CirculationError::NotFound { .. } => "NOT_FOUND",
            CirculationError::AlreadyIssued { .. } => "ALREADY_ISSUED",
            CirculationError::NoActiveLoan { .. } => "NO_ACTIVE_LOAN",
            CirculationError::TransactionFailed { .. } => "TRANSACTION_FAILED",
        }
    }
}

impl From<StoreError> for CirculationError {
    /// A single failed attempt. A missing catalog record stays `NotFound`.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CopyNotFound { copy_id } => CirculationError::NotFound { copy_id },
            source => CirculationError::TransactionFailed {
                attempts: 1,
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let timeout = StoreError::LockTimeout {
            copy_id: CopyId::new("c1"),
        };
        assert!(timeout.is_retryable());

        let io = StoreError::Wal(shelfdb_wal::WalError::Io(std::io::Error::other("disk")));
        assert!(io.is_retryable());

        let closed = StoreError::Wal(shelfdb_wal::WalError::Closed);
        assert!(!closed.is_retryable());
        assert_eq!(closed.error_code(), "WAL_CLOSED");

        let violation = StoreError::ConstraintViolation {
            reason: "copy already has an open loan".to_string(),
        };
        assert!(!violation.is_retryable());
        assert_eq!(violation.error_code(), "CONSTRAINT_VIOLATION");
    }

    #[test]
    fn test_circulation_codes() {
        let err = CirculationError::TransactionFailed {
            attempts: 3,
            source: StoreError::LockTimeout {
                copy_id: CopyId::new("c1"),
            },
        };
        assert_eq!(err.error_code(), "TRANSACTION_FAILED");
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
