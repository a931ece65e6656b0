//! Storage layer using RocksDB
//!
//! This is the Ledger Entry Store and the materialized Balance Aggregate.
//! It performs no business validation beyond sequence and idempotency
//! checks; the transaction processor is its only writer.
//!
//! # Column Families
//!
//! - `balances` - Balance aggregate (key: account)
//! - `entries` - Append-only entry log (key: account || sequence)
//! - `idempotency` - Applied causal events (key: account || idempotency key)
//! - `withdrawals` - Withdrawal requests (key: withdrawal_id)
//! - `escrow_locks` - Escrow locks (key: lock_id)
//! - `indices` - Secondary indices (seller -> withdrawals, seller -> locks,
//!   order -> latest lock)

use crate::{
    error::{Error, Result},
    types::{
        AccountBalance, AccountId, EscrowLock, IdempotencyRecord, LedgerEntry, WithdrawalRequest,
    },
    Config,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Column family names
const CF_BALANCES: &str = "balances";
const CF_ENTRIES: &str = "entries";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_WITHDRAWALS: &str = "withdrawals";
const CF_ESCROW_LOCKS: &str = "escrow_locks";
const CF_INDICES: &str = "indices";

/// Index key tags
const IDX_SELLER_WITHDRAWAL: u8 = b'W';
const IDX_SELLER_ESCROW: u8 = b'E';
const IDX_ORDER_ESCROW: u8 = b'O';

/// Everything one account contributes to an atomic unit
#[derive(Debug, Clone)]
pub struct AccountCommit {
    /// Balance after all entries
    pub balance: AccountBalance,
    /// New entries, contiguous, starting at the stored `last_entry_id + 1`
    pub entries: Vec<LedgerEntry>,
    /// Causal event key for the entries
    pub idempotency_key: Option<String>,
}

/// One atomic write: entries, balances and entity rows together
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    /// Per-account changes
    pub accounts: Vec<AccountCommit>,
    /// Withdrawal rows to upsert
    pub withdrawals: Vec<WithdrawalRequest>,
    /// Escrow rows to upsert
    pub escrow_locks: Vec<EscrowLock>,
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BALANCES, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_WITHDRAWALS, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_ESCROW_LOCKS, Self::cf_options_lz4()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened seller ledger store");

        Ok(Self { db })
    }

    // Column family options

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_lz4() -> Options {
        let mut opts = Options::default();
        // Hot rows, read on every operation
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Keys (and values) under `prefix`, starting at `start`, at most `limit`
    fn scan_prefix(
        &self,
        cf: &str,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) || out.len() >= limit {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    // Balance operations

    /// Stored balance row, if the account has ever been written
    pub fn get_balance(&self, account: &AccountId) -> Result<Option<AccountBalance>> {
        self.get_value(CF_BALANCES, &account.storage_key())
    }

    /// Current balance; zero for accounts with no entries
    pub fn current_balance(&self, account: &AccountId) -> Result<AccountBalance> {
        Ok(self
            .get_balance(account)?
            .unwrap_or_else(|| AccountBalance::new(account.clone())))
    }

    /// Every account with a balance row
    pub fn list_accounts(&self) -> Result<Vec<AccountId>> {
        let cf = self.cf_handle(CF_BALANCES)?;
        let mut accounts = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let balance: AccountBalance = bincode::deserialize(&value)?;
            accounts.push(balance.account);
        }
        Ok(accounts)
    }

    // Entry operations

    fn entry_key(account: &AccountId, id: u64) -> Vec<u8> {
        let mut key = account.storage_key();
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    /// Get entry by account and sequence id
    pub fn get_entry(&self, account: &AccountId, id: u64) -> Result<Option<LedgerEntry>> {
        self.get_value(CF_ENTRIES, &Self::entry_key(account, id))
    }

    /// Entries with `id > after_id`, in sequence order, at most `limit`
    pub fn get_entries(
        &self,
        account: &AccountId,
        after_id: u64,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let prefix = account.storage_key();
        let start = Self::entry_key(account, after_id.saturating_add(1));

        self.scan_prefix(CF_ENTRIES, &prefix, &start, limit)?
            .into_iter()
            .map(|(_, value)| Ok(bincode::deserialize(&value)?))
            .collect()
    }

    // Idempotency

    fn idempotency_key(account: &AccountId, key: &str) -> Vec<u8> {
        let mut k = account.storage_key();
        k.extend_from_slice(key.as_bytes());
        k
    }

    /// Record for an already-applied causal event
    pub fn get_idempotency(
        &self,
        account: &AccountId,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        self.get_value(CF_IDEMPOTENCY, &Self::idempotency_key(account, key))
    }

    /// Entries produced by an already-applied causal event
    pub fn entries_for(
        &self,
        account: &AccountId,
        record: &IdempotencyRecord,
    ) -> Result<Vec<LedgerEntry>> {
        let entries = self.get_entries(
            account,
            record.first_entry_id - 1,
            record.entry_count as usize,
        )?;
        if entries.len() != record.entry_count as usize {
            return Err(Error::InvariantViolation(format!(
                "{}: idempotency record points at {} entries from {}, found {}",
                account,
                record.entry_count,
                record.first_entry_id,
                entries.len()
            )));
        }
        Ok(entries)
    }

    // Withdrawal and escrow rows

    fn index_key(tag: u8, owner: &[u8], id: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + owner.len() + id.len());
        key.push(tag);
        key.extend_from_slice(owner);
        key.extend_from_slice(id);
        key
    }

    fn index_ids(&self, tag: u8, owner: &AccountId) -> Result<Vec<Uuid>> {
        let prefix = Self::index_key(tag, &owner.storage_key(), &[]);
        self.scan_prefix(CF_INDICES, &prefix, &prefix, usize::MAX)?
            .into_iter()
            .filter_map(|(key, _)| {
                let raw: Option<[u8; 16]> = key.get(prefix.len()..).and_then(|b| b.try_into().ok());
                raw.map(|b| Ok(Uuid::from_bytes(b)))
            })
            .collect()
    }

    /// Get withdrawal by ID
    pub fn get_withdrawal(&self, id: Uuid) -> Result<Option<WithdrawalRequest>> {
        self.get_value(CF_WITHDRAWALS, id.as_bytes())
    }

    /// All withdrawals of a seller, oldest first
    pub fn list_withdrawals(&self, seller: &AccountId) -> Result<Vec<WithdrawalRequest>> {
        let mut requests = Vec::new();
        for id in self.index_ids(IDX_SELLER_WITHDRAWAL, seller)? {
            if let Some(request) = self.get_withdrawal(id)? {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    /// Get escrow lock by ID
    pub fn get_escrow_lock(&self, id: Uuid) -> Result<Option<EscrowLock>> {
        self.get_value(CF_ESCROW_LOCKS, id.as_bytes())
    }

    /// Latest escrow lock created for an order
    pub fn escrow_lock_for_order(&self, order_id: &str) -> Result<Option<EscrowLock>> {
        let key = Self::index_key(IDX_ORDER_ESCROW, order_id.as_bytes(), &[]);
        let cf = self.cf_handle(CF_INDICES)?;
        match self.db.get_cf(cf, &key)? {
            Some(raw) => {
                let bytes: [u8; 16] = raw.as_slice().try_into().map_err(|_| {
                    Error::Storage(format!("Corrupt escrow index for order {}", order_id))
                })?;
                self.get_escrow_lock(Uuid::from_bytes(bytes))
            }
            None => Ok(None),
        }
    }

    /// All escrow locks of a seller, oldest first
    pub fn list_escrow_locks(&self, seller: &AccountId) -> Result<Vec<EscrowLock>> {
        let mut locks = Vec::new();
        for id in self.index_ids(IDX_SELLER_ESCROW, seller)? {
            if let Some(lock) = self.get_escrow_lock(id)? {
                locks.push(lock);
            }
        }
        Ok(locks)
    }

    // Atomic writes

    /// Append a single entry with its balance update (atomic).
    ///
    /// Fails with `SequenceConflict` unless `entry.id` is the next id for the
    /// account, and with `DuplicateIdempotencyKey` if the key was already
    /// recorded.
    pub fn append(&self, entry: &LedgerEntry, balance: &AccountBalance) -> Result<()> {
        self.commit(&CommitBatch {
            accounts: vec![AccountCommit {
                balance: balance.clone(),
                entries: vec![entry.clone()],
                idempotency_key: Some(entry.idempotency_key.clone()),
            }],
            ..Default::default()
        })
    }

    /// Write entries, balances, idempotency records, entity rows and
    /// indices in one `WriteBatch`.
    ///
    /// Nothing is written if any account fails its sequence or idempotency
    /// check.
    pub fn commit(&self, batch: &CommitBatch) -> Result<()> {
        let cf_balances = self.cf_handle(CF_BALANCES)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_idempotency = self.cf_handle(CF_IDEMPOTENCY)?;
        let cf_withdrawals = self.cf_handle(CF_WITHDRAWALS)?;
        let cf_escrow = self.cf_handle(CF_ESCROW_LOCKS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let mut wb = WriteBatch::default();

        for commit in &batch.accounts {
            let account = &commit.balance.account;
            let stored = self.current_balance(account)?;

            let mut expected = stored.last_entry_id + 1;
            for entry in &commit.entries {
                if entry.id != expected || &entry.account != account {
                    return Err(Error::SequenceConflict {
                        account: account.clone(),
                        expected,
                        actual: entry.id,
                    });
                }
                expected += 1;
            }

            if let Some(key) = &commit.idempotency_key {
                if self.get_idempotency(account, key)?.is_some() {
                    return Err(Error::DuplicateIdempotencyKey {
                        account: account.clone(),
                        key: key.clone(),
                    });
                }
                if let Some(first) = commit.entries.first() {
                    let record = IdempotencyRecord {
                        first_entry_id: first.id,
                        entry_count: commit.entries.len() as u32,
                    };
                    wb.put_cf(
                        cf_idempotency,
                        Self::idempotency_key(account, key),
                        bincode::serialize(&record)?,
                    );
                }
            }

            for entry in &commit.entries {
                wb.put_cf(
                    cf_entries,
                    Self::entry_key(account, entry.id),
                    bincode::serialize(entry)?,
                );
            }

            wb.put_cf(
                cf_balances,
                account.storage_key(),
                bincode::serialize(&commit.balance)?,
            );
        }

        for request in &batch.withdrawals {
            wb.put_cf(cf_withdrawals, request.id.as_bytes(), bincode::serialize(request)?);
            let idx = Self::index_key(
                IDX_SELLER_WITHDRAWAL,
                &request.account().storage_key(),
                request.id.as_bytes(),
            );
            wb.put_cf(cf_indices, idx, b"");
        }

        for lock in &batch.escrow_locks {
            wb.put_cf(cf_escrow, lock.id.as_bytes(), bincode::serialize(lock)?);
            let idx = Self::index_key(
                IDX_SELLER_ESCROW,
                &lock.account().storage_key(),
                lock.id.as_bytes(),
            );
            wb.put_cf(cf_indices, idx, b"");
            let order_idx = Self::index_key(IDX_ORDER_ESCROW, lock.order_id.as_bytes(), &[]);
            wb.put_cf(cf_indices, order_idx, lock.id.as_bytes());
        }

        self.db.write(wb)?;

        Ok(())
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_accounts: self.approximate_count(self.cf_handle(CF_BALANCES)?)?,
            total_entries: self.approximate_count(self.cf_handle(CF_ENTRIES)?)?,
            total_withdrawals: self.approximate_count(self.cf_handle(CF_WITHDRAWALS)?)?,
            total_escrow_locks: self.approximate_count(self.cf_handle(CF_ESCROW_LOCKS)?)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics (approximate)
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    /// Accounts with a balance row
    pub total_accounts: u64,
    /// Ledger entries
    pub total_entries: u64,
    /// Withdrawal requests
    pub total_withdrawals: u64,
    /// Escrow locks
    pub total_escrow_locks: u64,
}
