//! Replay and audit of account ledgers
//!
//! The entry log is authoritative; the balance row is a cache. Replaying
//! the log recomputes the cache and checks every link on the way.

use crate::{
    crypto::{to_hex, verify_entry},
    types::{AccountBalance, AccountId, BalanceSnapshot, LedgerEntry},
    Error, Result, Storage,
};
use serde::{Deserialize, Serialize};

const REPLAY_PAGE: usize = 1024;

/// Findings of one account audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Audited account
    pub account: AccountId,
    /// Entries replayed
    pub entries_checked: u64,
    /// Cached aggregate
    pub cached: BalanceSnapshot,
    /// Aggregate recomputed from entries
    pub replayed: BalanceSnapshot,
    /// Sum of open withdrawals and active escrow locks
    pub held: u64,
    /// Human-readable problems, empty when clean
    pub violations: Vec<String>,
}

impl AuditReport {
    /// No problems found
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

fn for_each_entry<F>(storage: &Storage, account: &AccountId, mut f: F) -> Result<()>
where
    F: FnMut(LedgerEntry) -> Result<()>,
{
    let mut after = 0;
    loop {
        let page = storage.get_entries(account, after, REPLAY_PAGE)?;
        let full = page.len() == REPLAY_PAGE;
        for entry in page {
            after = entry.id;
            f(entry)?;
        }
        if !full {
            return Ok(());
        }
    }
}

/// Recompute an account's balance by replaying its entry log.
///
/// `version` is left at 0; callers that persist the result set it.
pub fn rebuild_balance(storage: &Storage, account: &AccountId) -> Result<AccountBalance> {
    let mut balance = AccountBalance::new(account.clone());

    for_each_entry(storage, account, |entry| {
        balance.apply_delta(entry.bucket, entry.delta).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "{} entry {} drives {} out of range",
                account, entry.id, entry.bucket
            ))
        })?;
        balance.last_entry_id = entry.id;
        balance.last_hash = entry.hash;
        Ok(())
    })?;

    Ok(balance)
}

/// Replay an account and report every broken invariant
pub fn audit_account(storage: &Storage, account: &AccountId) -> Result<AuditReport> {
    let cached = storage.current_balance(account)?;
    let mut state = AccountBalance::new(account.clone());
    let mut violations = Vec::new();
    let mut checked = 0u64;

    for_each_entry(storage, account, |entry| {
        checked += 1;
        let expected_id = state.last_entry_id + 1;

        if entry.id != expected_id {
            violations.push(format!("entry {} found where {} expected", entry.id, expected_id));
        }
        if &entry.account != account {
            violations.push(format!("entry {} belongs to {}", entry.id, entry.account));
        }
        if entry.prev_hash != state.last_hash {
            violations.push(format!(
                "entry {} prev_hash {} does not link to {}",
                entry.id,
                to_hex(&entry.prev_hash),
                to_hex(&state.last_hash)
            ));
        }
        if !verify_entry(&entry)? {
            violations.push(format!("entry {} hash does not match contents", entry.id));
        }

        let before = state.get(entry.bucket);
        if entry.balance_before != before {
            violations.push(format!(
                "entry {} {} balance_before {} but previous after is {}",
                entry.id, entry.bucket, entry.balance_before, before
            ));
        }
        match state.apply_delta(entry.bucket, entry.delta) {
            Some((_, after)) if after == entry.balance_after => {}
            Some((_, after)) => violations.push(format!(
                "entry {} {} balance_after {} but replay gives {}",
                entry.id, entry.bucket, entry.balance_after, after
            )),
            None => violations.push(format!(
                "entry {} drives {} negative",
                entry.id, entry.bucket
            )),
        }

        state.last_entry_id = entry.id;
        state.last_hash = entry.hash;
        Ok(())
    })?;

    if state.snapshot() != cached.snapshot() {
        violations.push(format!(
            "cached balance {:?} differs from replay {:?}",
            cached.snapshot(),
            state.snapshot()
        ));
    }
    if state.last_entry_id != cached.last_entry_id {
        violations.push(format!(
            "cached last entry {} differs from log tail {}",
            cached.last_entry_id, state.last_entry_id
        ));
    }

    let mut held = 0u64;
    if let AccountId::Seller(_) = account {
        for request in storage.list_withdrawals(account)? {
            if !request.status.is_terminal() {
                held = held.saturating_add(request.amount);
            }
        }
        for lock in storage.list_escrow_locks(account)? {
            if lock.is_active() {
                held = held.saturating_add(lock.amount);
            }
        }
    }
    if held != cached.locked {
        violations.push(format!(
            "locked is {} but open withdrawals and escrow hold {}",
            cached.locked, held
        ));
    }

    Ok(AuditReport {
        account: account.clone(),
        entries_checked: checked,
        cached: cached.snapshot(),
        replayed: state.snapshot(),
        held,
        violations,
    })
}
