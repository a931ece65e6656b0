//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact integer arithmetic in the smallest currency unit
//! - Ownership by the ledger subsystem only (callers read, never write)

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Ledger account: a seller balance or a platform user wallet.
///
/// Both kinds share the same entry store and processor mechanics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccountId {
    /// Seller balance ledger
    Seller(String),
    /// Platform-wide user wallet ledger
    UserWallet(String),
}

impl AccountId {
    /// Seller account
    pub fn seller(id: impl Into<String>) -> Self {
        AccountId::Seller(id.into())
    }

    /// User wallet account
    pub fn user_wallet(id: impl Into<String>) -> Self {
        AccountId::UserWallet(id.into())
    }

    /// Raw identifier without the account kind
    pub fn id(&self) -> &str {
        match self {
            AccountId::Seller(id) | AccountId::UserWallet(id) => id,
        }
    }

    /// Length-prefixed storage key.
    ///
    /// A prefix scan over one account can never match another account
    /// whose id merely starts with the same characters.
    pub fn storage_key(&self) -> Vec<u8> {
        let tag = match self {
            AccountId::Seller(_) => b's',
            AccountId::UserWallet(_) => b'w',
        };
        let id = self.id().as_bytes();
        let mut key = Vec::with_capacity(id.len() + 5);
        key.push(tag);
        key.extend_from_slice(&(id.len() as u32).to_be_bytes());
        key.extend_from_slice(id);
        key
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountId::Seller(id) => write!(f, "seller:{}", id),
            AccountId::UserWallet(id) => write!(f, "wallet:{}", id),
        }
    }
}

/// Balance bucket touched by a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Bucket {
    /// Spendable now
    Available = 1,
    /// Earned, not yet settled
    Pending = 2,
    /// Reserved for a withdrawal or escrow hold
    Locked = 3,
}

impl Bucket {
    /// All buckets in storage order
    pub const ALL: [Bucket; 3] = [Bucket::Available, Bucket::Pending, Bucket::Locked];

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Available => "available",
            Bucket::Pending => "pending",
            Bucket::Locked => "locked",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Sale proceeds credited to pending
    SaleCredit = 1,
    /// Platform commission
    PlatformFee = 2,
    /// Funds reserved for a withdrawal
    WithdrawalLock = 3,
    /// Withdrawal rejected or failed, funds returned
    WithdrawalRelease = 4,
    /// Withdrawal paid out, funds leave the ledger
    WithdrawalSettle = 5,
    /// Sale refunded before settlement
    Refund = 6,
    /// Listing boost paid from available
    BoostPurchase = 7,
    /// Funds held for an order
    EscrowLock = 8,
    /// Escrow released to the seller
    EscrowReleaseToSeller = 9,
    /// Escrow refunded to the buyer
    EscrowReleaseToBuyer = 10,
    /// Seller funds moved to a user wallet
    TransferOut = 11,
    /// User wallet side of a transfer
    TransferIn = 12,
    /// Pending sale proceeds became spendable
    SaleRelease = 13,
}

impl EntryKind {
    /// Kebab-case name, used for metrics labels and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::SaleCredit => "sale-credit",
            EntryKind::PlatformFee => "platform-fee",
            EntryKind::WithdrawalLock => "withdrawal-lock",
            EntryKind::WithdrawalRelease => "withdrawal-release",
            EntryKind::WithdrawalSettle => "withdrawal-settle",
            EntryKind::Refund => "refund",
            EntryKind::BoostPurchase => "boost-purchase",
            EntryKind::EscrowLock => "escrow-lock",
            EntryKind::EscrowReleaseToSeller => "escrow-release-to-seller",
            EntryKind::EscrowReleaseToBuyer => "escrow-release-to-buyer",
            EntryKind::TransferOut => "transfer-out",
            EntryKind::TransferIn => "transfer-in",
            EntryKind::SaleRelease => "sale-release",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External object type that caused an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceType {
    /// Marketplace order
    Order,
    /// Withdrawal request
    Withdrawal,
    /// Dispute on an order
    Dispute,
    /// Seller to wallet transfer
    Transfer,
    /// Listing boost
    Boost,
    /// Standalone platform fee
    Fee,
}

/// External object that caused an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Object type
    pub reference_type: ReferenceType,
    /// Object id
    pub reference_id: String,
}

impl Reference {
    /// Create a reference
    pub fn new(reference_type: ReferenceType, reference_id: impl Into<String>) -> Self {
        Self {
            reference_type,
            reference_id: reference_id.into(),
        }
    }

    /// Order reference
    pub fn order(order_id: impl Into<String>) -> Self {
        Self::new(ReferenceType::Order, order_id)
    }
}

/// Validated positive amount in the smallest currency unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(u64);

impl Amount {
    /// Validate a caller-supplied amount.
    ///
    /// Rejects zero, negative and fractional values, and values that do not
    /// fit a signed delta.
    pub fn from_decimal(value: Decimal) -> crate::Result<Self> {
        if value <= Decimal::ZERO {
            return Err(crate::Error::InvalidAmount(format!(
                "{} must be positive",
                value
            )));
        }
        if !value.fract().is_zero() {
            return Err(crate::Error::InvalidAmount(format!(
                "{} is not a whole number of minor units",
                value
            )));
        }
        if value > Decimal::from(i64::MAX) {
            return Err(crate::Error::InvalidAmount(format!("{} is too large", value)));
        }
        let units = value
            .to_u64()
            .ok_or_else(|| crate::Error::InvalidAmount(format!("{} is out of range", value)))?;
        Ok(Self(units))
    }

    /// Minor units
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Positive delta
    pub fn credit(&self) -> i64 {
        self.0 as i64
    }

    /// Negative delta
    pub fn debit(&self) -> i64 {
        -(self.0 as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current balance triple for one account (the Balance Aggregate).
///
/// Materialized cache of the entry log, written in the same batch as
/// every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account
    pub account: AccountId,
    /// Spendable now
    pub available: u64,
    /// Earned, not yet settled
    pub pending: u64,
    /// Reserved
    pub locked: u64,
    /// Optimistic concurrency version, bumped on every commit
    pub version: u64,
    /// Id of the newest entry (0 when empty)
    pub last_entry_id: u64,
    /// Hash of the newest entry (zeros when empty)
    pub last_hash: [u8; 32],
}

impl AccountBalance {
    /// Empty balance
    pub fn new(account: AccountId) -> Self {
        Self {
            account,
            available: 0,
            pending: 0,
            locked: 0,
            version: 0,
            last_entry_id: 0,
            last_hash: [0u8; 32],
        }
    }

    /// Value of one bucket
    pub fn get(&self, bucket: Bucket) -> u64 {
        match bucket {
            Bucket::Available => self.available,
            Bucket::Pending => self.pending,
            Bucket::Locked => self.locked,
        }
    }

    fn slot(&mut self, bucket: Bucket) -> &mut u64 {
        match bucket {
            Bucket::Available => &mut self.available,
            Bucket::Pending => &mut self.pending,
            Bucket::Locked => &mut self.locked,
        }
    }

    /// Apply a signed delta, returning `(before, after)`.
    ///
    /// Returns `None` if the bucket would go negative or overflow.
    pub fn apply_delta(&mut self, bucket: Bucket, delta: i64) -> Option<(u64, u64)> {
        let slot = self.slot(bucket);
        let before = *slot;
        let after = if delta >= 0 {
            before.checked_add(delta as u64)?
        } else {
            before.checked_sub(delta.unsigned_abs())?
        };
        *slot = after;
        Some((before, after))
    }

    /// Sum of all buckets
    pub fn total(&self) -> u128 {
        self.available as u128 + self.pending as u128 + self.locked as u128
    }

    /// The three buckets without bookkeeping fields
    pub fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            available: self.available,
            pending: self.pending,
            locked: self.locked,
        }
    }
}

/// `(available, pending, locked)` as returned to readers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Spendable now
    pub available: u64,
    /// Earned, not yet settled
    pub pending: u64,
    /// Reserved
    pub locked: u64,
}

impl BalanceSnapshot {
    /// Convenience constructor
    pub fn new(available: u64, pending: u64, locked: u64) -> Self {
        Self {
            available,
            pending,
            locked,
        }
    }
}

/// Immutable record of one bucket mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Per-account sequence number, starting at 1
    pub id: u64,
    /// Account mutated
    pub account: AccountId,
    /// Bucket mutated
    pub bucket: Bucket,
    /// Signed change
    pub delta: i64,
    /// Bucket value before
    pub balance_before: u64,
    /// Bucket value after
    pub balance_after: u64,
    /// Cause
    pub kind: EntryKind,
    /// External object
    pub reference: Reference,
    /// Causal event key, shared by all entries of one atomic leg
    pub idempotency_key: String,
    /// Commit time
    pub created_at: DateTime<Utc>,
    /// Hash of the previous entry of this account
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    pub hash: [u8; 32],
}

/// Maps an idempotency key to the entries it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// First entry id of the leg
    pub first_entry_id: u64,
    /// Number of entries in the leg
    pub entry_count: u32,
}

/// Payout speed requested by the seller.
///
/// Only affects approval policy; lock and settle mechanics are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalMethod {
    /// Fast payout
    Fast,
    /// Normal payout, manual sign-off
    Normal,
}

/// Destination bank account, opaque to the ledger
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BankDetails {
    /// Bank name
    pub bank_name: String,
    /// Account holder
    pub account_holder: String,
    /// Account number
    pub account_number: String,
}

/// Withdrawal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WithdrawalStatus {
    /// Created, funds locked
    Pending = 1,
    /// Approved, awaiting payout
    Approved = 2,
    /// Rejected (terminal), funds returned
    Rejected = 3,
    /// Paid out (terminal)
    Settled = 4,
    /// Payout failed (terminal), funds returned
    Failed = 5,
}

impl WithdrawalStatus {
    /// Check terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Rejected | WithdrawalStatus::Settled | WithdrawalStatus::Failed
        )
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Settled => "settled",
            WithdrawalStatus::Failed => "failed",
        }
    }
}

/// Seller withdrawal request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Request id (UUIDv7)
    pub id: Uuid,
    /// Seller
    pub seller_id: String,
    /// Locked amount
    pub amount: u64,
    /// Payout method
    pub method: WithdrawalMethod,
    /// Destination
    pub bank_details: BankDetails,
    /// Current status
    pub status: WithdrawalStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the request reached a terminal state
    pub resolved_at: Option<DateTime<Utc>>,
    /// Reason given on reject/fail
    pub resolution_reason: Option<String>,
}

impl WithdrawalRequest {
    /// Ledger account of the seller
    pub fn account(&self) -> AccountId {
        AccountId::seller(&self.seller_id)
    }
}

/// Escrow lock status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EscrowStatus {
    /// Funds held
    Active = 1,
    /// Released to the seller's available bucket
    ReleasedToSeller = 2,
    /// Refunded to the buyer, funds left the ledger
    ReleasedToBuyer = 3,
}

/// Where escrowed funds are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowSource {
    /// Sale proceeds awaiting buyer confirmation
    Pending,
    /// Already-spendable funds (e.g. dispute opened after settlement)
    Available,
}

impl EscrowSource {
    /// Bucket debited by the lock
    pub fn bucket(&self) -> Bucket {
        match self {
            EscrowSource::Pending => Bucket::Pending,
            EscrowSource::Available => Bucket::Available,
        }
    }
}

/// Escrow release outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseTarget {
    /// Seller keeps the funds
    Seller,
    /// Buyer is refunded
    Buyer,
}

/// Hold on seller funds tied to one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowLock {
    /// Lock id (UUIDv7)
    pub id: Uuid,
    /// Seller
    pub seller_id: String,
    /// Order
    pub order_id: String,
    /// Held amount
    pub amount: u64,
    /// Bucket the funds came from
    pub source: EscrowSource,
    /// Current status
    pub status: EscrowStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Resolution time
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscrowLock {
    /// Ledger account of the seller
    pub fn account(&self) -> AccountId {
        AccountId::seller(&self.seller_id)
    }

    /// Still holding funds
    pub fn is_active(&self) -> bool {
        self.status == EscrowStatus::Active
    }
}
