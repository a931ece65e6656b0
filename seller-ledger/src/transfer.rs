//! Transfer service: seller available → user wallet
//!
//! Both ledgers change in one atomic pair or neither does.

use crate::{
    processor::{Leg, Posting, TransactionProcessor},
    types::{AccountId, Amount, Bucket, EntryKind, LedgerEntry, Reference, ReferenceType},
    Result,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Result of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Caller key or generated id
    pub transfer_id: String,
    /// Moved amount
    pub amount: u64,
    /// Seller debit entries
    pub seller_entries: Vec<LedgerEntry>,
    /// Wallet credit entries
    pub wallet_entries: Vec<LedgerEntry>,
    /// True when `transfer_id` had already been applied
    pub replayed: bool,
}

/// Transfer service
#[derive(Debug)]
pub struct TransferService {
    processor: Arc<TransactionProcessor>,
}

impl TransferService {
    /// Create service
    pub fn new(processor: Arc<TransactionProcessor>) -> Self {
        Self { processor }
    }

    /// Transfer under a freshly generated id
    pub async fn transfer(
        &self,
        seller_id: &str,
        user_wallet_id: &str,
        amount: impl Into<Decimal>,
    ) -> Result<TransferReceipt> {
        let transfer_id = Uuid::now_v7().to_string();
        self.transfer_with_key(seller_id, user_wallet_id, amount, &transfer_id)
            .await
    }

    /// Transfer under a caller-chosen key; resubmitting the key replays the
    /// original receipt
    pub async fn transfer_with_key(
        &self,
        seller_id: &str,
        user_wallet_id: &str,
        amount: impl Into<Decimal>,
        transfer_id: &str,
    ) -> Result<TransferReceipt> {
        let amount = Amount::from_decimal(amount.into())?;
        let reference = Reference::new(ReferenceType::Transfer, transfer_id);
        let key = format!("transfer:{}", transfer_id);

        let debit = Leg::new(AccountId::seller(seller_id), reference.clone(), key.clone())
            .posting(Posting::debit(Bucket::Available, amount, EntryKind::TransferOut));
        let credit = Leg::new(AccountId::user_wallet(user_wallet_id), reference, key)
            .posting(Posting::credit(Bucket::Available, amount, EntryKind::TransferIn));

        let (seller, wallet) = self.processor.apply_pair(debit, credit).await?;

        if !seller.replayed {
            info!(
                transfer_id,
                seller_id,
                user_wallet_id,
                amount = amount.get(),
                "Transfer committed"
            );
        }

        Ok(TransferReceipt {
            transfer_id: transfer_id.to_string(),
            amount: amount.get(),
            replayed: seller.replayed && wallet.replayed,
            seller_entries: seller.entries,
            wallet_entries: wallet.entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics::Metrics, Config, Error, Storage};
    use tempfile::TempDir;

    fn service() -> (TransferService, Arc<TransactionProcessor>, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let processor = Arc::new(TransactionProcessor::new(
            storage,
            config.retry,
            Metrics::new().unwrap(),
        ));
        (TransferService::new(processor.clone()), processor, temp)
    }

    async fn fund(processor: &TransactionProcessor, seller_id: &str, amount: i64) {
        processor
            .apply(
                &AccountId::seller(seller_id),
                Bucket::Available,
                amount,
                EntryKind::SaleRelease,
                Reference::order("seed"),
                "seed",
            )
            .await
            .unwrap();
    }

    fn available(processor: &TransactionProcessor, account: &AccountId) -> u64 {
        processor.storage().current_balance(account).unwrap().available
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let (transfers, processor, _temp) = service();
        fund(&processor, "s1", 1_000).await;

        let receipt = transfers.transfer("s1", "u1", 250).await.unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.seller_entries[0].kind, EntryKind::TransferOut);
        assert_eq!(receipt.wallet_entries[0].kind, EntryKind::TransferIn);

        assert_eq!(available(&processor, &AccountId::seller("s1")), 750);
        assert_eq!(available(&processor, &AccountId::user_wallet("u1")), 250);
    }

    #[tokio::test]
    async fn test_transfer_insufficient_funds() {
        let (transfers, processor, _temp) = service();
        fund(&processor, "s1", 100).await;

        let err = transfers.transfer("s1", "u1", 101).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert_eq!(available(&processor, &AccountId::seller("s1")), 100);
        assert!(processor
            .storage()
            .get_balance(&AccountId::user_wallet("u1"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_transfer_with_key_replays() {
        let (transfers, processor, _temp) = service();
        fund(&processor, "s1", 1_000).await;

        let first = transfers.transfer_with_key("s1", "u1", 300, "t-1").await.unwrap();
        let second = transfers.transfer_with_key("s1", "u1", 300, "t-1").await.unwrap();

        assert!(second.replayed);
        assert_eq!(first.seller_entries, second.seller_entries);
        assert_eq!(available(&processor, &AccountId::seller("s1")), 700);
        assert_eq!(available(&processor, &AccountId::user_wallet("u1")), 300);
    }

    #[tokio::test]
    async fn test_partially_applied_key_rejected() {
        let (transfers, processor, _temp) = service();
        fund(&processor, "s1", 1_000).await;

        // Wallet leg already carries the transfer key, seller leg does not
        processor
            .apply(
                &AccountId::user_wallet("u1"),
                Bucket::Available,
                10,
                EntryKind::TransferIn,
                Reference::new(ReferenceType::Transfer, "t-1"),
                "transfer:t-1",
            )
            .await
            .unwrap();

        let err = transfers.transfer_with_key("s1", "u1", 300, "t-1").await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert_eq!(available(&processor, &AccountId::seller("s1")), 1_000);
        assert_eq!(available(&processor, &AccountId::user_wallet("u1")), 10);
    }
}
