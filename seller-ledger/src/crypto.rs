//! Hash chain over ledger entries
//!
//! Every entry stores the SHA-256 hash of its predecessor in the same
//! account, so a rewritten or dropped entry breaks every later link.

use crate::types::{AccountId, Bucket, EntryKind, LedgerEntry, Reference};
use crate::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Fields covered by an entry hash (everything except the hash itself)
#[derive(Serialize)]
struct CanonicalEntry<'a> {
    id: u64,
    account: &'a AccountId,
    bucket: Bucket,
    delta: i64,
    balance_before: u64,
    balance_after: u64,
    kind: EntryKind,
    reference: &'a Reference,
    idempotency_key: &'a str,
    created_at_nanos: i64,
    prev_hash: &'a [u8; 32],
}

/// Deterministic bytes of an entry, excluding its `hash` field
pub fn canonical_bytes(entry: &LedgerEntry) -> Result<Vec<u8>> {
    let canonical = CanonicalEntry {
        id: entry.id,
        account: &entry.account,
        bucket: entry.bucket,
        delta: entry.delta,
        balance_before: entry.balance_before,
        balance_after: entry.balance_after,
        kind: entry.kind,
        reference: &entry.reference,
        idempotency_key: &entry.idempotency_key,
        created_at_nanos: entry.created_at.timestamp_nanos_opt().unwrap_or(0),
        prev_hash: &entry.prev_hash,
    };
    Ok(bincode::serialize(&canonical)?)
}

/// Hash an entry using SHA-256
pub fn hash_entry(entry: &LedgerEntry) -> Result<[u8; 32]> {
    Ok(hash_bytes(&canonical_bytes(entry)?))
}

/// Check that the stored hash matches the entry contents
pub fn verify_entry(entry: &LedgerEntry) -> Result<bool> {
    Ok(hash_entry(entry)? == entry.hash)
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex, for logs
pub fn to_hex(hash: &[u8; 32]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}
