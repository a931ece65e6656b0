//! Main ledger interface

use crate::{
    audit::{self, AuditReport},
    config::Config,
    escrow::EscrowController,
    error::{Error, Result},
    metrics::Metrics,
    processor::{Applied, Leg, Plan, Posting, TransactionProcessor},
    storage::{Storage, StorageStats},
    transfer::{TransferReceipt, TransferService},
    types::{
        AccountId, Amount, BalanceSnapshot, BankDetails, Bucket, EntryKind, EscrowLock,
        EscrowSource, LedgerEntry, Reference, ReferenceType, ReleaseTarget, WithdrawalMethod,
        WithdrawalRequest,
    },
    withdrawal::WithdrawalWorkflow,
};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::{info, warn};
use uuid::Uuid;

/// Seller balance ledger
///
/// Entry point for every operation collaborators may trigger. Balances are
/// only ever changed through the [`TransactionProcessor`].
#[derive(Debug)]
pub struct Ledger {
    config: Config,
    storage: Arc<Storage>,
    processor: Arc<TransactionProcessor>,
    withdrawals: WithdrawalWorkflow,
    escrow: EscrowController,
    transfers: TransferService,
    metrics: Metrics,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Open storage
        let storage = Arc::new(Storage::open(&config)?);

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let processor = Arc::new(TransactionProcessor::new(
            storage.clone(),
            config.retry.clone(),
            metrics.clone(),
        ));

        info!(
            data_dir = %config.data_dir.display(),
            max_attempts = config.retry.max_attempts,
            "Seller ledger opened"
        );

        Ok(Self {
            withdrawals: WithdrawalWorkflow::new(
                processor.clone(),
                config.withdrawal.clone(),
                metrics.clone(),
            ),
            escrow: EscrowController::new(processor.clone()),
            transfers: TransferService::new(processor.clone()),
            config,
            storage,
            processor,
            metrics,
        })
    }

    /// Transaction processor, for callers composing their own postings
    pub fn processor(&self) -> &TransactionProcessor {
        &self.processor
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // Sales and fees

    /// Credit sale proceeds to pending
    pub async fn credit_sale(
        &self,
        seller_id: &str,
        order_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<Applied> {
        let amount = Amount::from_decimal(amount.into())?;
        let leg = sale_leg(seller_id, order_id)
            .posting(Posting::credit(Bucket::Pending, amount, EntryKind::SaleCredit));
        self.single("credit-sale", leg).await
    }

    /// Credit gross proceeds and deduct the platform fee in one unit
    pub async fn credit_sale_with_fee(
        &self,
        seller_id: &str,
        order_id: &str,
        gross: impl Into<Decimal>,
        fee: impl Into<Decimal>,
    ) -> Result<Applied> {
        let gross = Amount::from_decimal(gross.into())?;
        let fee = Amount::from_decimal(fee.into())?;
        if fee > gross {
            return Err(Error::InvalidAmount(format!(
                "fee {} exceeds gross {}",
                fee, gross
            )));
        }

        let leg = sale_leg(seller_id, order_id)
            .posting(Posting::credit(Bucket::Pending, gross, EntryKind::SaleCredit))
            .posting(Posting::debit(Bucket::Pending, fee, EntryKind::PlatformFee));
        self.single("credit-sale", leg).await
    }

    /// Move settled sale proceeds from pending to available
    pub async fn release_pending(
        &self,
        seller_id: &str,
        order_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<Applied> {
        let amount = Amount::from_decimal(amount.into())?;
        let leg = Leg::new(
            AccountId::seller(seller_id),
            Reference::order(order_id),
            format!("sale-release:{}", order_id),
        )
        .move_funds(Bucket::Pending, Bucket::Available, amount, EntryKind::SaleRelease);
        self.single("release-pending", leg).await
    }

    /// Remove refunded sale proceeds from pending
    pub async fn refund_sale(
        &self,
        seller_id: &str,
        order_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<Applied> {
        let amount = Amount::from_decimal(amount.into())?;
        let leg = Leg::new(
            AccountId::seller(seller_id),
            Reference::order(order_id),
            format!("refund:{}", order_id),
        )
        .posting(Posting::debit(Bucket::Pending, amount, EntryKind::Refund));
        self.single("refund-sale", leg).await
    }

    /// One of several partial refunds of an order, keyed by `refund_id`
    pub async fn refund_sale_with_key(
        &self,
        seller_id: &str,
        order_id: &str,
        refund_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<Applied> {
        let amount = Amount::from_decimal(amount.into())?;
        let leg = Leg::new(
            AccountId::seller(seller_id),
            Reference::order(order_id),
            format!("refund:{}:{}", order_id, refund_id),
        )
        .posting(Posting::debit(Bucket::Pending, amount, EntryKind::Refund));
        self.single("refund-sale", leg).await
    }

    /// Charge a platform fee against available
    pub async fn charge_platform_fee(
        &self,
        seller_id: &str,
        reference_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<Applied> {
        let amount = Amount::from_decimal(amount.into())?;
        let leg = Leg::new(
            AccountId::seller(seller_id),
            Reference::new(ReferenceType::Fee, reference_id),
            format!("platform-fee:{}", reference_id),
        )
        .posting(Posting::debit(Bucket::Available, amount, EntryKind::PlatformFee));
        self.single("charge-platform-fee", leg).await
    }

    /// Pay for a listing boost from available
    pub async fn purchase_boost(
        &self,
        seller_id: &str,
        boost_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<Applied> {
        let amount = Amount::from_decimal(amount.into())?;
        let leg = Leg::new(
            AccountId::seller(seller_id),
            Reference::new(ReferenceType::Boost, boost_id),
            format!("boost:{}", boost_id),
        )
        .posting(Posting::debit(Bucket::Available, amount, EntryKind::BoostPurchase));
        self.single("purchase-boost", leg).await
    }

    // Withdrawals

    /// Create a withdrawal request, locking its amount
    pub async fn create_withdrawal(
        &self,
        seller_id: &str,
        amount: impl Into<Decimal>,
        method: WithdrawalMethod,
        bank_details: BankDetails,
    ) -> Result<Uuid> {
        let request = self
            .withdrawals
            .create(seller_id, amount, method, bank_details)
            .await?;
        Ok(request.id)
    }

    /// Same as [`Ledger::create_withdrawal`], keyed for safe resubmission
    pub async fn create_withdrawal_with_key(
        &self,
        seller_id: &str,
        amount: impl Into<Decimal>,
        method: WithdrawalMethod,
        bank_details: BankDetails,
        request_key: &str,
    ) -> Result<Uuid> {
        let request = self
            .withdrawals
            .create_with_key(seller_id, amount, method, bank_details, request_key)
            .await?;
        Ok(request.id)
    }

    /// Approve a pending withdrawal
    pub async fn approve_withdrawal(&self, withdrawal_id: Uuid) -> Result<()> {
        self.withdrawals.approve(withdrawal_id).await.map(|_| ())
    }

    /// Settle an approved withdrawal
    pub async fn settle_withdrawal(&self, withdrawal_id: Uuid) -> Result<()> {
        self.withdrawals.settle(withdrawal_id).await.map(|_| ())
    }

    /// Reject a pending withdrawal
    pub async fn reject_withdrawal(&self, withdrawal_id: Uuid, reason: &str) -> Result<()> {
        self.withdrawals
            .reject(withdrawal_id, reason)
            .await
            .map(|_| ())
    }

    /// Mark an approved withdrawal's payout as failed
    pub async fn fail_withdrawal(&self, withdrawal_id: Uuid, reason: &str) -> Result<()> {
        self.withdrawals.fail(withdrawal_id, reason).await.map(|_| ())
    }

    /// Get withdrawal request
    pub fn get_withdrawal(&self, withdrawal_id: Uuid) -> Result<WithdrawalRequest> {
        self.withdrawals.get(withdrawal_id)
    }

    /// List a seller's withdrawal requests
    pub fn list_withdrawals(&self, seller_id: &str) -> Result<Vec<WithdrawalRequest>> {
        self.withdrawals.list(seller_id)
    }

    // Escrow

    /// Hold pending sale proceeds for an order
    pub async fn lock_escrow(
        &self,
        seller_id: &str,
        order_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<Uuid> {
        self.lock_escrow_from(seller_id, order_id, amount, EscrowSource::Pending)
            .await
    }

    /// Hold funds for an order from a chosen bucket
    pub async fn lock_escrow_from(
        &self,
        seller_id: &str,
        order_id: &str,
        amount: impl Into<Decimal>,
        source: EscrowSource,
    ) -> Result<Uuid> {
        let lock = self.escrow.lock(seller_id, order_id, amount, source).await?;
        Ok(lock.id)
    }

    /// Resolve an order's escrow lock
    pub async fn release_escrow(&self, order_id: &str, to: ReleaseTarget) -> Result<()> {
        self.escrow.release(order_id, to).await.map(|_| ())
    }

    /// Latest escrow lock of an order
    pub fn get_escrow(&self, order_id: &str) -> Result<EscrowLock> {
        self.escrow.get(order_id)
    }

    /// List a seller's escrow locks
    pub fn list_escrow_locks(&self, seller_id: &str) -> Result<Vec<EscrowLock>> {
        self.escrow.list(seller_id)
    }

    // Transfers

    /// Move seller available funds into a user wallet
    pub async fn transfer_to_user_wallet(
        &self,
        seller_id: &str,
        user_wallet_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<TransferReceipt> {
        self.transfers
            .transfer(seller_id, user_wallet_id, amount)
            .await
    }

    /// Same as [`Ledger::transfer_to_user_wallet`], keyed for safe resubmission
    pub async fn transfer_to_user_wallet_with_key(
        &self,
        seller_id: &str,
        user_wallet_id: &str,
        amount: impl Into<Decimal>,
        transfer_id: &str,
    ) -> Result<TransferReceipt> {
        self.transfers
            .transfer_with_key(seller_id, user_wallet_id, amount, transfer_id)
            .await
    }

    // Reads

    /// Current `(available, pending, locked)` of a seller
    pub fn get_balance(&self, seller_id: &str) -> Result<BalanceSnapshot> {
        self.get_account_balance(&AccountId::seller(seller_id))
    }

    /// Current balance of a user wallet
    pub fn get_wallet_balance(&self, user_wallet_id: &str) -> Result<BalanceSnapshot> {
        self.get_account_balance(&AccountId::user_wallet(user_wallet_id))
    }

    /// Current balance of any account
    pub fn get_account_balance(&self, account: &AccountId) -> Result<BalanceSnapshot> {
        Ok(self.storage.current_balance(account)?.snapshot())
    }

    /// Entries of `account` with id greater than `since_id`, read lazily
    pub fn get_ledger(&self, account: &AccountId, since_id: u64) -> LedgerCursor {
        LedgerCursor::new(
            self.storage.clone(),
            account.clone(),
            since_id,
            self.config.ledger_page_size,
        )
    }

    /// [`Ledger::get_ledger`] as an async stream
    pub fn ledger_stream(
        &self,
        account: &AccountId,
        since_id: u64,
    ) -> impl Stream<Item = Result<LedgerEntry>> {
        tokio_stream::iter(self.get_ledger(account, since_id))
    }

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    // Audit and replay

    /// Recompute a balance from the entry log without touching the cache
    pub fn rebuild_balance(&self, account: &AccountId) -> Result<BalanceSnapshot> {
        Ok(audit::rebuild_balance(&self.storage, account)?.snapshot())
    }

    /// Check an account's entry chain and cached balance
    pub fn audit_account(&self, account: &AccountId) -> Result<AuditReport> {
        let report = audit::audit_account(&self.storage, account)?;
        for violation in &report.violations {
            warn!(account = %account, violation = %violation, "Ledger audit violation");
        }
        Ok(report)
    }

    /// Rewrite a drifted cached balance from the entry log
    pub fn repair_balance(&self, account: &AccountId) -> Result<BalanceSnapshot> {
        Ok(self.processor.repair_balance(account)?.snapshot())
    }

    /// Audit every account that has a balance row
    pub fn audit_all(&self) -> Result<Vec<AuditReport>> {
        let accounts = self.storage.list_accounts()?;
        let mut reports = Vec::with_capacity(accounts.len());
        for account in &accounts {
            reports.push(self.audit_account(account)?);
        }

        let dirty = reports.iter().filter(|r| !r.is_clean()).count();
        info!(accounts = accounts.len(), dirty, "Ledger audit complete");
        Ok(reports)
    }

    async fn single(&self, operation: &str, leg: Leg) -> Result<Applied> {
        let mut outcome = self
            .processor
            .execute(operation, |_| Ok(Plan::leg(leg.clone())))
            .await?;
        outcome
            .legs
            .pop()
            .ok_or_else(|| Error::InvariantViolation(format!("{} produced no leg", operation)))
    }
}

fn sale_leg(seller_id: &str, order_id: &str) -> Leg {
    Leg::new(
        AccountId::seller(seller_id),
        Reference::order(order_id),
        format!("sale-credit:{}", order_id),
    )
}

/// Lazy, page-at-a-time reader over one account's entries
#[derive(Debug)]
pub struct LedgerCursor {
    storage: Arc<Storage>,
    account: AccountId,
    after_id: u64,
    page_size: usize,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

impl LedgerCursor {
    fn new(storage: Arc<Storage>, account: AccountId, since_id: u64, page_size: usize) -> Self {
        Self {
            storage,
            account,
            after_id: since_id,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Id of the last entry yielded (or the starting `since_id`)
    pub fn position(&self) -> u64 {
        self.after_id
    }
}

impl Iterator for LedgerCursor {
    type Item = Result<LedgerEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self
                .storage
                .get_entries(&self.account, self.after_id, self.page_size)
            {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let entry = self.buffer.pop_front()?;
        self.after_id = entry.id;
        Some(Ok(entry))
    }
}
