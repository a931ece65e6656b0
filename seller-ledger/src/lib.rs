//! Seller balance ledger
//!
//! Append-only, hash-chained ledger of seller balances with withdrawal,
//! escrow and wallet-transfer workflows on top.
//!
//! # Architecture
//!
//! - **Entry log**: every bucket change is an immutable, per-account
//!   sequenced entry; the balance row is a cache rebuilt by replay
//! - **Optimistic commits**: per-account versions, re-verified under
//!   short per-account latches acquired in ascending order
//! - **Atomic units**: entries, balances, idempotency records and workflow
//!   rows of one operation land in a single RocksDB write batch
//!
//! # Invariants
//!
//! - Conservation: `available + pending + locked` equals the sum of an
//!   account's entry deltas
//! - Non-negativity: no bucket ever goes below zero
//! - Exactly-once: an idempotency key is applied at most once per account
//! - Chain integrity: entry `n` starts where entry `n-1` of the same bucket
//!   ended, and links to its hash

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod crypto;
pub mod processor;
pub mod withdrawal;
pub mod escrow;
pub mod transfer;
pub mod audit;
pub mod ledger;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use audit::AuditReport;
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerCursor};
pub use processor::{Applied, Leg, Posting, TransactionProcessor};
pub use storage::Storage;
pub use transfer::TransferReceipt;
pub use types::{
    AccountId, BalanceSnapshot, BankDetails, Bucket, EntryKind, EscrowLock, EscrowSource,
    EscrowStatus, LedgerEntry, Reference, ReferenceType, ReleaseTarget, WithdrawalMethod,
    WithdrawalRequest, WithdrawalStatus,
};
