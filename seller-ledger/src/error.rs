//! Error types for the seller ledger

use crate::types::{AccountId, Bucket};
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// A debit would take a bucket below zero
    #[error("Insufficient funds in {account} {bucket}: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Account being debited
        account: AccountId,
        /// Bucket being debited
        bucket: Bucket,
        /// Amount requested
        requested: u64,
        /// Amount held in the bucket at evaluation time
        available: u64,
    },

    /// Amount is zero, negative, fractional or out of range
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Entry id is not the next sequence number for the account
    #[error("Sequence conflict on {account}: expected entry {expected}, got {actual}")]
    SequenceConflict {
        /// Account whose sequence was violated
        account: AccountId,
        /// Next id the store expected
        expected: u64,
        /// Id that was presented
        actual: u64,
    },

    /// Optimistic retries exhausted
    #[error("Contention: gave up after {attempts} attempts")]
    Contention {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Idempotency key already recorded for the account
    #[error("Idempotency key {key} already applied on {account}")]
    DuplicateIdempotencyKey {
        /// Account the key belongs to
        account: AccountId,
        /// The repeated key
        key: String,
    },

    /// Idempotency key reused for different postings
    #[error("Idempotency key {key} on {account} was applied with different postings")]
    IdempotencyMismatch {
        /// Account the key belongs to
        account: AccountId,
        /// The reused key
        key: String,
    },

    /// An active escrow lock already exists for the order
    #[error("Active escrow lock already exists for order {0}")]
    DuplicateLock(String),

    /// Withdrawal or escrow lock already reached a terminal state
    #[error("Already resolved: {0}")]
    AlreadyResolved(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Withdrawal is not in `pending`
    #[error("Withdrawal {0} is not pending")]
    NotPending(Uuid),

    /// Withdrawal is not in `approved`
    #[error("Withdrawal {0} is not approved")]
    NotApproved(Uuid),

    /// Invariant violation (conservation, chain integrity, partial pair)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may resubmit the whole logical operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Contention { .. } | Error::SequenceConflict { .. })
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Contention { attempts: 5 }.is_retryable());
        assert!(Error::SequenceConflict {
            account: AccountId::seller("s1"),
            expected: 2,
            actual: 3,
        }
        .is_retryable());
        assert!(!Error::InvalidAmount("zero".to_string()).is_retryable());
        assert!(!Error::DuplicateLock("order-1".to_string()).is_retryable());
        assert!(!Error::IdempotencyMismatch {
            account: AccountId::seller("s1"),
            key: "refund:o1".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_insufficient_funds_message() {
        let err = Error::InsufficientFunds {
            account: AccountId::seller("s1"),
            bucket: Bucket::Available,
            requested: 30_000,
            available: 20_000,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient funds in seller:s1 available: requested 30000, available 20000"
        );
    }
}
