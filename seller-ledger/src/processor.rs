//! Transaction processor
//!
//! The only writer of balances and ledger entries. Every mutation is an
//! optimistic commit:
//!
//! ```text
//!  plan(&Storage) ──► prepare: read balances + versions, compute entries
//!        ▲                         │
//!        │ conflict                ▼
//!  backoff + re-plan ◄── latch accounts (ascending) ──► verify versions,
//!                                                       idempotency, rows
//!                                                            │
//!                                                            ▼
//!                                               Storage::commit (WriteBatch)
//! ```
//!
//! Latches are per account and are held only for the synchronous
//! verify-and-write section. There is no global lock: operations on
//! different accounts never wait for each other. A latch is removed from the
//! map once nobody holds or awaits it.

use crate::{
    audit,
    config::RetryConfig,
    crypto::hash_entry,
    metrics::Metrics,
    storage::{AccountCommit, CommitBatch},
    types::{
        AccountBalance, AccountId, Amount, Bucket, EntryKind, EscrowLock, EscrowStatus,
        IdempotencyRecord, LedgerEntry, Reference, WithdrawalRequest, WithdrawalStatus,
    },
    Error, Result, Storage,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// One bucket change inside a leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    /// Bucket changed
    pub bucket: Bucket,
    /// Signed change
    pub delta: i64,
    /// Cause
    pub kind: EntryKind,
}

impl Posting {
    /// Add `amount` to `bucket`
    pub fn credit(bucket: Bucket, amount: Amount, kind: EntryKind) -> Self {
        Self {
            bucket,
            delta: amount.credit(),
            kind,
        }
    }

    /// Remove `amount` from `bucket`
    pub fn debit(bucket: Bucket, amount: Amount, kind: EntryKind) -> Self {
        Self {
            bucket,
            delta: amount.debit(),
            kind,
        }
    }
}

/// All postings one causal event makes on one account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leg {
    /// Account changed
    pub account: AccountId,
    /// Postings, applied in order
    pub postings: Vec<Posting>,
    /// External object
    pub reference: Reference,
    /// Causal event key
    pub idempotency_key: String,
}

impl Leg {
    /// Empty leg
    pub fn new(account: AccountId, reference: Reference, idempotency_key: impl Into<String>) -> Self {
        Self {
            account,
            postings: Vec::new(),
            reference,
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Add a posting
    pub fn posting(mut self, posting: Posting) -> Self {
        self.postings.push(posting);
        self
    }

    /// Move `amount` between two buckets of the same account
    pub fn move_funds(self, from: Bucket, to: Bucket, amount: Amount, kind: EntryKind) -> Self {
        self.posting(Posting::debit(from, amount, kind))
            .posting(Posting::credit(to, amount, kind))
    }
}

/// Entity row written in the same atomic unit as the legs
#[derive(Debug, Clone)]
pub enum RowWrite {
    /// Upsert a withdrawal whose stored status must equal `expected`
    /// (`None`: must not exist yet)
    Withdrawal {
        /// Required stored status
        expected: Option<WithdrawalStatus>,
        /// New row
        request: WithdrawalRequest,
    },
    /// Upsert an escrow lock whose stored status must equal `expected`
    /// (`None`: the order must have no active lock)
    Escrow {
        /// Required stored status
        expected: Option<EscrowStatus>,
        /// New row
        lock: EscrowLock,
    },
}

impl RowWrite {
    fn latch_keys(&self) -> Vec<String> {
        match self {
            RowWrite::Withdrawal { request, .. } => vec![request.account().to_string()],
            RowWrite::Escrow { lock, .. } => {
                vec![lock.account().to_string(), format!("order:{}", lock.order_id)]
            }
        }
    }
}

/// What an operation wants to commit
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Legs, each on a distinct account
    pub legs: Vec<Leg>,
    /// Guarded entity rows
    pub rows: Vec<RowWrite>,
}

impl Plan {
    /// Plan with one leg
    pub fn leg(leg: Leg) -> Self {
        Self {
            legs: vec![leg],
            rows: Vec::new(),
        }
    }

    /// Add a row write
    pub fn with_row(mut self, row: RowWrite) -> Self {
        self.rows.push(row);
        self
    }
}

/// Result of one leg
#[derive(Debug, Clone)]
pub struct Applied {
    /// Account changed
    pub account: AccountId,
    /// Entries of the leg (the original ones on replay)
    pub entries: Vec<LedgerEntry>,
    /// Balance after the commit (current balance on replay)
    pub balance: AccountBalance,
    /// True when the idempotency key had already been applied
    pub replayed: bool,
}

/// Result of one committed (or replayed) plan
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// One result per planned leg, in plan order
    pub legs: Vec<Applied>,
    /// Rows written with the legs (empty on replay)
    pub rows: Vec<RowWrite>,
}

impl Outcome {
    /// First withdrawal row written
    pub fn withdrawal(&self) -> Option<&WithdrawalRequest> {
        self.rows.iter().find_map(|row| match row {
            RowWrite::Withdrawal { request, .. } => Some(request),
            _ => None,
        })
    }

    /// First escrow row written
    pub fn escrow_lock(&self) -> Option<&EscrowLock> {
        self.rows.iter().find_map(|row| match row {
            RowWrite::Escrow { lock, .. } => Some(lock),
            _ => None,
        })
    }
}

struct PreparedLeg {
    expected_version: u64,
    commit: AccountCommit,
}

enum Prepared {
    Replay(Vec<Applied>),
    Commit(Vec<PreparedLeg>),
    Stale(String),
}

enum CommitOutcome {
    Committed(Vec<Applied>),
    Conflict(String),
}

/// Transaction processor
pub struct TransactionProcessor {
    storage: Arc<Storage>,
    latches: DashMap<String, Arc<Mutex<()>>>,
    retry: RetryConfig,
    metrics: Metrics,
}

impl std::fmt::Debug for TransactionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionProcessor")
            .field("latches", &self.latches.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl TransactionProcessor {
    /// Create processor over a store
    pub fn new(storage: Arc<Storage>, retry: RetryConfig, metrics: Metrics) -> Self {
        Self {
            storage,
            latches: DashMap::new(),
            retry,
            metrics,
        }
    }

    /// Read access to the store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Latches currently held or awaited
    pub fn latch_count(&self) -> usize {
        self.latches.len()
    }

    /// Apply one signed delta to one bucket.
    ///
    /// Re-presenting an `idempotency_key` returns the original entry without
    /// applying the delta again.
    pub async fn apply(
        &self,
        account: &AccountId,
        bucket: Bucket,
        delta: i64,
        kind: EntryKind,
        reference: Reference,
        idempotency_key: &str,
    ) -> Result<Applied> {
        let leg = Leg::new(account.clone(), reference, idempotency_key).posting(Posting {
            bucket,
            delta,
            kind,
        });

        let mut outcome = self.execute(kind.as_str(), |_| Ok(Plan::leg(leg.clone()))).await?;
        outcome
            .legs
            .pop()
            .ok_or_else(|| Error::InvariantViolation("apply produced no leg".to_string()))
    }

    /// Apply two legs on two accounts as one all-or-nothing unit.
    ///
    /// Both accounts are latched in ascending order regardless of
    /// direction.
    pub async fn apply_pair(&self, leg1: Leg, leg2: Leg) -> Result<(Applied, Applied)> {
        let plan = Plan {
            legs: vec![leg1, leg2],
            rows: Vec::new(),
        };
        let mut outcome = self.execute("apply-pair", |_| Ok(plan.clone())).await?;
        match (outcome.legs.pop(), outcome.legs.pop()) {
            (Some(second), Some(first)) => Ok((first, second)),
            _ => Err(Error::InvariantViolation(
                "apply_pair produced fewer than two legs".to_string(),
            )),
        }
    }

    /// Plan, verify and commit with bounded optimistic retries.
    ///
    /// `plan` runs against the latest committed state on every attempt, so
    /// validation errors it returns always reflect current state. Fails with
    /// `Contention` once `retry.max_attempts` attempts have conflicted.
    pub async fn execute<F>(&self, operation: &str, plan: F) -> Result<Outcome>
    where
        F: Fn(&Storage) -> Result<Plan>,
    {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt - 1);
                self.metrics.record_contention_retry();
                tokio::time::sleep(delay).await;
            }

            let plan = plan(&self.storage)?;

            let conflict = match self.prepare(&plan)? {
                Prepared::Replay(applied) => {
                    self.metrics.record_replay();
                    tracing::debug!(operation, "Idempotent replay");
                    return Ok(Outcome {
                        legs: applied,
                        rows: Vec::new(),
                    });
                }
                Prepared::Stale(reason) => reason,
                Prepared::Commit(legs) => match self.try_commit(&plan, legs)? {
                    CommitOutcome::Committed(applied) => {
                        return Ok(Outcome {
                            legs: applied,
                            rows: plan.rows,
                        })
                    }
                    CommitOutcome::Conflict(reason) => reason,
                },
            };

            tracing::warn!(
                operation,
                attempt = attempt + 1,
                max_attempts,
                reason = %conflict,
                "Optimistic commit conflicted"
            );
        }

        self.metrics.record_contention_failure();
        tracing::error!(operation, attempts = max_attempts, "Retries exhausted");
        Err(Error::Contention {
            attempts: max_attempts,
        })
    }

    /// Rewrite an account's cached balance from its entry log
    pub fn repair_balance(&self, account: &AccountId) -> Result<AccountBalance> {
        self.latched(vec![account.to_string()], || self.rewrite_balance(account))
    }

    fn rewrite_balance(&self, account: &AccountId) -> Result<AccountBalance> {
        let current = self.storage.current_balance(account)?;
        let mut rebuilt = audit::rebuild_balance(&self.storage, account)?;
        rebuilt.version = current.version + 1;

        self.storage.commit(&CommitBatch {
            accounts: vec![AccountCommit {
                balance: rebuilt.clone(),
                entries: Vec::new(),
                idempotency_key: None,
            }],
            ..Default::default()
        })?;

        tracing::warn!(
            account = %account,
            available = rebuilt.available,
            pending = rebuilt.pending,
            locked = rebuilt.locked,
            "Balance aggregate rebuilt from ledger"
        );
        Ok(rebuilt)
    }

    fn prepare(&self, plan: &Plan) -> Result<Prepared> {
        for (i, leg) in plan.legs.iter().enumerate() {
            if leg.postings.is_empty() {
                return Err(Error::InvalidAmount(format!(
                    "leg {} on {} has no postings",
                    leg.idempotency_key, leg.account
                )));
            }
            if plan.legs[..i].iter().any(|other| other.account == leg.account) {
                return Err(Error::InvariantViolation(format!(
                    "{} appears in more than one leg",
                    leg.account
                )));
            }
        }

        let mut records: Vec<Option<IdempotencyRecord>> = Vec::with_capacity(plan.legs.len());
        for leg in &plan.legs {
            records.push(
                self.storage
                    .get_idempotency(&leg.account, &leg.idempotency_key)?,
            );
        }

        let replayed = records.iter().filter(|r| r.is_some()).count();
        if replayed > 0 {
            if replayed < plan.legs.len() {
                return self.confirm_partial(plan);
            }
            if !plan.rows.is_empty() {
                return Ok(Prepared::Stale(
                    "legs already applied while rows still pending".to_string(),
                ));
            }

            let mut applied = Vec::with_capacity(plan.legs.len());
            for (leg, record) in plan.legs.iter().zip(records) {
                if let Some(record) = record {
                    let entries = self.storage.entries_for(&leg.account, &record)?;
                    if !same_postings(leg, &entries) {
                        tracing::warn!(
                            account = %leg.account,
                            key = %leg.idempotency_key,
                            "Idempotency key resubmitted with different postings"
                        );
                        return Err(Error::IdempotencyMismatch {
                            account: leg.account.clone(),
                            key: leg.idempotency_key.clone(),
                        });
                    }
                    applied.push(Applied {
                        account: leg.account.clone(),
                        entries,
                        balance: self.storage.current_balance(&leg.account)?,
                        replayed: true,
                    });
                }
            }
            return Ok(Prepared::Replay(applied));
        }

        let mut prepared = Vec::with_capacity(plan.legs.len());
        for leg in &plan.legs {
            prepared.push(self.prepare_leg(leg)?);
        }
        Ok(Prepared::Commit(prepared))
    }

    fn prepare_leg(&self, leg: &Leg) -> Result<PreparedLeg> {
        let mut balance = self.storage.current_balance(&leg.account)?;
        let expected_version = balance.version;
        let now = Utc::now();

        let mut entries = Vec::with_capacity(leg.postings.len());
        for posting in &leg.postings {
            if posting.delta == 0 {
                return Err(Error::InvalidAmount("delta must be non-zero".to_string()));
            }

            let available = balance.get(posting.bucket);
            let (before, after) = balance
                .apply_delta(posting.bucket, posting.delta)
                .ok_or_else(|| {
                    if posting.delta < 0 {
                        Error::InsufficientFunds {
                            account: leg.account.clone(),
                            bucket: posting.bucket,
                            requested: posting.delta.unsigned_abs(),
                            available,
                        }
                    } else {
                        Error::InvalidAmount(format!(
                            "{} {} would overflow",
                            leg.account, posting.bucket
                        ))
                    }
                })?;

            let mut entry = LedgerEntry {
                id: balance.last_entry_id + 1,
                account: leg.account.clone(),
                bucket: posting.bucket,
                delta: posting.delta,
                balance_before: before,
                balance_after: after,
                kind: posting.kind,
                reference: leg.reference.clone(),
                idempotency_key: leg.idempotency_key.clone(),
                created_at: now,
                prev_hash: balance.last_hash,
                hash: [0u8; 32],
            };
            entry.hash = hash_entry(&entry)?;

            balance.last_entry_id = entry.id;
            balance.last_hash = entry.hash;
            entries.push(entry);
        }
        balance.version = expected_version + 1;

        Ok(PreparedLeg {
            expected_version,
            commit: AccountCommit {
                balance,
                entries,
                idempotency_key: Some(leg.idempotency_key.clone()),
            },
        })
    }

    /// Some legs of a multi-leg plan were already applied and some were not.
    /// Re-read under latches: a concurrent identical commit makes this a
    /// replay on the next attempt, anything else is a broken pair.
    fn confirm_partial(&self, plan: &Plan) -> Result<Prepared> {
        let keys = plan.legs.iter().map(|l| l.account.to_string()).collect();
        self.latched(keys, || self.count_partial(plan))
    }

    fn count_partial(&self, plan: &Plan) -> Result<Prepared> {
        let mut applied = 0;
        for leg in &plan.legs {
            if self
                .storage
                .get_idempotency(&leg.account, &leg.idempotency_key)?
                .is_some()
            {
                applied += 1;
            }
        }

        if applied == plan.legs.len() {
            return Ok(Prepared::Stale("legs applied concurrently".to_string()));
        }

        let keys: Vec<String> = plan
            .legs
            .iter()
            .map(|l| format!("{}/{}", l.account, l.idempotency_key))
            .collect();
        tracing::error!(legs = ?keys, "Idempotency keys applied on only part of a multi-leg unit");
        Err(Error::InvariantViolation(format!(
            "partially applied multi-leg unit: {}",
            keys.join(", ")
        )))
    }

    fn try_commit(&self, plan: &Plan, legs: Vec<PreparedLeg>) -> Result<CommitOutcome> {
        let mut keys: Vec<String> = legs
            .iter()
            .map(|l| l.commit.balance.account.to_string())
            .collect();
        for row in &plan.rows {
            keys.extend(row.latch_keys());
        }
        self.latched(keys, || self.verify_and_write(plan, legs))
    }

    /// Runs with every account and row latch of `plan` held
    fn verify_and_write(&self, plan: &Plan, legs: Vec<PreparedLeg>) -> Result<CommitOutcome> {
        let started = Instant::now();

        for leg in &legs {
            let account = &leg.commit.balance.account;
            let current = self.storage.current_balance(account)?;
            if current.version != leg.expected_version {
                return Ok(CommitOutcome::Conflict(format!(
                    "{} version moved from {} to {}",
                    account, leg.expected_version, current.version
                )));
            }
            if let Some(key) = &leg.commit.idempotency_key {
                if self.storage.get_idempotency(account, key)?.is_some() {
                    return Ok(CommitOutcome::Conflict(format!(
                        "{} key {} applied concurrently",
                        account, key
                    )));
                }
            }
        }

        for row in &plan.rows {
            if let Some(reason) = self.row_conflict(row)? {
                return Ok(CommitOutcome::Conflict(reason));
            }
        }

        let mut batch = CommitBatch::default();
        for row in &plan.rows {
            match row {
                RowWrite::Withdrawal { request, .. } => batch.withdrawals.push(request.clone()),
                RowWrite::Escrow { lock, .. } => batch.escrow_locks.push(lock.clone()),
            }
        }
        batch.accounts = legs.into_iter().map(|l| l.commit).collect();

        match self.storage.commit(&batch) {
            Ok(()) => {}
            Err(e @ Error::SequenceConflict { .. }) | Err(e @ Error::DuplicateIdempotencyKey { .. }) => {
                return Ok(CommitOutcome::Conflict(e.to_string()));
            }
            Err(e) => return Err(e),
        }

        self.metrics
            .record_commit(started.elapsed().as_secs_f64());

        let mut applied = Vec::with_capacity(batch.accounts.len());
        for commit in batch.accounts {
            for entry in &commit.entries {
                self.metrics.record_entry(entry.kind);
                tracing::debug!(
                    account = %entry.account,
                    entry_id = entry.id,
                    bucket = %entry.bucket,
                    delta = entry.delta,
                    kind = %entry.kind,
                    "Entry committed"
                );
            }
            applied.push(Applied {
                account: commit.balance.account.clone(),
                entries: commit.entries,
                balance: commit.balance,
                replayed: false,
            });
        }

        Ok(CommitOutcome::Committed(applied))
    }

    fn row_conflict(&self, row: &RowWrite) -> Result<Option<String>> {
        match row {
            RowWrite::Withdrawal { expected, request } => {
                let current = self.storage.get_withdrawal(request.id)?.map(|r| r.status);
                if current != *expected {
                    return Ok(Some(format!(
                        "withdrawal {} status is {:?}, expected {:?}",
                        request.id, current, expected
                    )));
                }
            }
            RowWrite::Escrow {
                expected: None,
                lock,
            } => {
                if let Some(existing) = self.storage.escrow_lock_for_order(&lock.order_id)? {
                    if existing.is_active() {
                        return Ok(Some(format!(
                            "order {} gained active lock {}",
                            lock.order_id, existing.id
                        )));
                    }
                }
            }
            RowWrite::Escrow {
                expected: Some(status),
                lock,
            } => {
                let current = self.storage.get_escrow_lock(lock.id)?.map(|l| l.status);
                if current != Some(*status) {
                    return Ok(Some(format!(
                        "escrow lock {} status is {:?}, expected {:?}",
                        lock.id, current, status
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Run `f` holding the latches for `keys`.
    ///
    /// Keys are sorted and deduplicated so every caller acquires them in the
    /// same global order. Afterwards each latch nobody else holds or awaits
    /// is dropped from the map; `entry` and `remove_if` both take the shard
    /// lock, so a latch cannot be removed while another caller clones it.
    fn latched<T>(&self, mut keys: Vec<String>, f: impl FnOnce() -> Result<T>) -> Result<T> {
        keys.sort();
        keys.dedup();

        let mutexes: Vec<(String, Arc<Mutex<()>>)> = keys
            .into_iter()
            .map(|key| {
                let latch = Arc::clone(&self.latches.entry(key.clone()).or_default());
                (key, latch)
            })
            .collect();

        let result = {
            let _guards: Vec<_> = mutexes.iter().map(|(_, m)| m.lock()).collect();
            f()
        };

        for (key, latch) in mutexes {
            drop(latch);
            self.latches
                .remove_if(&key, |_, m| Arc::strong_count(m) == 1);
        }
        result
    }
}

/// Whether recorded `entries` are what `leg` would have produced
fn same_postings(leg: &Leg, entries: &[LedgerEntry]) -> bool {
    leg.postings.len() == entries.len()
        && leg.postings.iter().zip(entries).all(|(posting, entry)| {
            posting.bucket == entry.bucket
                && posting.delta == entry.delta
                && posting.kind == entry.kind
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReferenceType;
    use crate::Config;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_processor() -> (TransactionProcessor, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let processor = TransactionProcessor::new(storage, config.retry, Metrics::new().unwrap());
        (processor, temp_dir)
    }

    fn amount(v: i64) -> Amount {
        Amount::from_decimal(Decimal::from(v)).unwrap()
    }

    #[tokio::test]
    async fn test_apply_credit_and_debit() {
        let (processor, _temp) = test_processor();
        let seller = AccountId::seller("s1");

        let first = processor
            .apply(&seller, Bucket::Pending, 500, EntryKind::SaleCredit, Reference::order("o1"), "k1")
            .await
            .unwrap();
        assert!(!first.replayed);
        assert_eq!(first.balance.pending, 500);
        assert_eq!(first.entries[0].balance_before, 0);
        assert_eq!(first.entries[0].balance_after, 500);
        assert_eq!(first.entries[0].prev_hash, [0u8; 32]);

        let second = processor
            .apply(&seller, Bucket::Pending, -200, EntryKind::Refund, Reference::order("o1"), "k2")
            .await
            .unwrap();
        assert_eq!(second.balance.pending, 300);
        assert_eq!(second.balance.version, 2);
        assert_eq!(second.entries[0].id, 2);
        assert_eq!(second.entries[0].prev_hash, first.entries[0].hash);
        assert_eq!(second.balance.last_hash, second.entries[0].hash);
    }

    #[tokio::test]
    async fn test_apply_rejects_overdraw() {
        let (processor, _temp) = test_processor();
        let seller = AccountId::seller("s1");

        processor
            .apply(&seller, Bucket::Available, 100, EntryKind::SaleRelease, Reference::order("o1"), "k1")
            .await
            .unwrap();

        let err = processor
            .apply(&seller, Bucket::Available, -101, EntryKind::BoostPurchase, Reference::new(ReferenceType::Boost, "b1"), "k2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds {
                requested: 101,
                available: 100,
                ..
            }
        ));

        let balance = processor.storage().current_balance(&seller).unwrap();
        assert_eq!(balance.available, 100);
        assert_eq!(balance.last_entry_id, 1);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (processor, _temp) = test_processor();
        let seller = AccountId::seller("s1");

        let first = processor
            .apply(&seller, Bucket::Pending, 700, EntryKind::SaleCredit, Reference::order("o1"), "sale:o1")
            .await
            .unwrap();
        let second = processor
            .apply(&seller, Bucket::Pending, 700, EntryKind::SaleCredit, Reference::order("o1"), "sale:o1")
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(first.entries, second.entries);
        assert_eq!(second.balance.pending, 700);
    }

    #[tokio::test]
    async fn test_zero_delta_rejected() {
        let (processor, _temp) = test_processor();
        let err = processor
            .apply(&AccountId::seller("s1"), Bucket::Pending, 0, EntryKind::SaleCredit, Reference::order("o1"), "k")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn test_move_funds_commits_both_entries() {
        let (processor, _temp) = test_processor();
        let seller = AccountId::seller("s1");
        processor
            .apply(&seller, Bucket::Available, 1_000, EntryKind::SaleRelease, Reference::order("o1"), "k1")
            .await
            .unwrap();

        let leg = Leg::new(seller.clone(), Reference::new(ReferenceType::Withdrawal, "w1"), "lock:w1")
            .move_funds(Bucket::Available, Bucket::Locked, amount(600), EntryKind::WithdrawalLock);
        let applied = processor
            .execute("test", |_| Ok(Plan::leg(leg.clone())))
            .await
            .unwrap()
            .legs;

        assert_eq!(applied[0].entries.len(), 2);
        assert_eq!(applied[0].balance.available, 400);
        assert_eq!(applied[0].balance.locked, 600);
        assert_eq!(applied[0].balance.version, 2);
        assert_eq!(applied[0].balance.last_entry_id, 3);
    }

    #[tokio::test]
    async fn test_apply_pair_second_leg_failure_leaves_first_untouched() {
        let (processor, _temp) = test_processor();
        let seller = AccountId::seller("s1");
        let wallet = AccountId::user_wallet("u1");
        processor
            .apply(&seller, Bucket::Available, 1_000, EntryKind::SaleRelease, Reference::order("o1"), "k1")
            .await
            .unwrap();

        let reference = Reference::new(ReferenceType::Transfer, "t1");
        let leg1 = Leg::new(seller.clone(), reference.clone(), "t1")
            .posting(Posting::debit(Bucket::Available, amount(400), EntryKind::TransferOut));
        // Wallet is empty: this debit cannot be applied
        let leg2 = Leg::new(wallet.clone(), reference, "t1")
            .posting(Posting::debit(Bucket::Available, amount(1), EntryKind::TransferIn));

        let err = processor.apply_pair(leg1, leg2).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let balance = processor.storage().current_balance(&seller).unwrap();
        assert_eq!(balance.available, 1_000);
        assert_eq!(balance.last_entry_id, 1);
        assert!(processor.storage().get_balance(&wallet).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_pair_rejects_same_account() {
        let (processor, _temp) = test_processor();
        let seller = AccountId::seller("s1");
        let reference = Reference::new(ReferenceType::Transfer, "t1");
        let leg = Leg::new(seller, reference, "t1")
            .posting(Posting::credit(Bucket::Available, amount(1), EntryKind::TransferIn));

        let err = processor.apply_pair(leg.clone(), leg).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_replay_with_different_postings_is_rejected() {
        let (processor, _temp) = test_processor();
        let seller = AccountId::seller("s1");
        processor
            .apply(&seller, Bucket::Pending, 700, EntryKind::SaleCredit, Reference::order("o1"), "sale:o1")
            .await
            .unwrap();

        let err = processor
            .apply(&seller, Bucket::Pending, 300, EntryKind::SaleCredit, Reference::order("o1"), "sale:o1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdempotencyMismatch { ref key, .. } if key == "sale:o1"));

        let balance = processor.storage().current_balance(&seller).unwrap();
        assert_eq!(balance.pending, 700);
        assert_eq!(balance.last_entry_id, 1);
    }

    #[tokio::test]
    async fn test_latches_are_released_after_commit() {
        let (processor, _temp) = test_processor();
        let reference = Reference::new(ReferenceType::Transfer, "t");

        for i in 0..50 {
            let leg1 = Leg::new(AccountId::seller(format!("s{}", i)), reference.clone(), "k")
                .posting(Posting::credit(Bucket::Available, amount(1), EntryKind::TransferIn));
            let leg2 = Leg::new(AccountId::user_wallet(format!("u{}", i)), reference.clone(), "k")
                .posting(Posting::credit(Bucket::Available, amount(1), EntryKind::TransferIn));
            processor.apply_pair(leg1, leg2).await.unwrap();
        }
        processor.repair_balance(&AccountId::seller("s0")).unwrap();

        assert_eq!(processor.latch_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_duration_excludes_latch_wait() {
        let (processor, _temp) = test_processor();
        let processor = Arc::new(processor);
        let seller = AccountId::seller("s1");

        let latch = Arc::clone(&processor.latches.entry(seller.to_string()).or_default());
        let guard = latch.lock();

        let handle = {
            let processor = processor.clone();
            let seller = seller.clone();
            tokio::spawn(async move {
                processor
                    .apply(&seller, Bucket::Pending, 10, EntryKind::SaleCredit, Reference::order("o1"), "k1")
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        drop(guard);
        handle.await.unwrap().unwrap();

        let histogram = &processor.metrics.commit_duration;
        assert_eq!(histogram.get_sample_count(), 1);
        assert!(histogram.get_sample_sum() < 0.5);
    }

    #[tokio::test]
    async fn test_stale_rows_exhaust_retries() {
        let (processor, _temp) = test_processor();
        let request = WithdrawalRequest {
            id: uuid::Uuid::now_v7(),
            seller_id: "s1".to_string(),
            amount: 10,
            method: crate::types::WithdrawalMethod::Normal,
            bank_details: Default::default(),
            status: WithdrawalStatus::Approved,
            created_at: Utc::now(),
            resolved_at: None,
            resolution_reason: None,
        };
        // Row never existed in `Pending`, so every attempt conflicts
        let plan = Plan::default().with_row(RowWrite::Withdrawal {
            expected: Some(WithdrawalStatus::Pending),
            request,
        });

        let err = processor
            .execute("test", |_| Ok(plan.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Contention { attempts: 5 }));
    }
}
