//! Escrow controller
//!
//! Holds seller funds for one order until the buyer confirms or a dispute
//! is decided. An order has at most one active lock; each lock resolves
//! exactly once.

use crate::{
    processor::{Leg, Plan, Posting, RowWrite, TransactionProcessor},
    types::{
        AccountId, Amount, Bucket, EntryKind, EscrowLock, EscrowSource, EscrowStatus, Reference,
        ReleaseTarget,
    },
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Escrow controller
#[derive(Debug)]
pub struct EscrowController {
    processor: Arc<TransactionProcessor>,
}

impl EscrowController {
    /// Create controller
    pub fn new(processor: Arc<TransactionProcessor>) -> Self {
        Self { processor }
    }

    /// Hold `amount` of the seller's `source` bucket for `order_id`
    pub async fn lock(
        &self,
        seller_id: &str,
        order_id: &str,
        amount: impl Into<Decimal>,
        source: EscrowSource,
    ) -> Result<EscrowLock> {
        let amount = Amount::from_decimal(amount.into())?;
        let lock = EscrowLock {
            id: Uuid::now_v7(),
            seller_id: seller_id.to_string(),
            order_id: order_id.to_string(),
            amount: amount.get(),
            source,
            status: EscrowStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
        };

        let leg = Leg::new(
            lock.account(),
            Reference::order(order_id),
            format!("escrow-lock:{}", lock.id),
        )
        .move_funds(source.bucket(), Bucket::Locked, amount, EntryKind::EscrowLock);

        let plan = Plan::leg(leg).with_row(RowWrite::Escrow {
            expected: None,
            lock: lock.clone(),
        });

        self.processor
            .execute("lock-escrow", |storage| {
                if let Some(existing) = storage.escrow_lock_for_order(order_id)? {
                    if existing.is_active() {
                        return Err(Error::DuplicateLock(order_id.to_string()));
                    }
                }
                Ok(plan.clone())
            })
            .await?;

        info!(
            lock_id = %lock.id,
            seller_id,
            order_id,
            amount = amount.get(),
            source = ?source,
            "Escrow locked"
        );
        Ok(lock)
    }

    /// Resolve the order's lock in favour of `target`
    pub async fn release(&self, order_id: &str, target: ReleaseTarget) -> Result<EscrowLock> {
        let outcome = self
            .processor
            .execute("release-escrow", |storage| {
                let current = storage.escrow_lock_for_order(order_id)?.ok_or_else(|| {
                    Error::NotFound(format!("escrow lock for order {}", order_id))
                })?;
                if !current.is_active() {
                    return Err(Error::AlreadyResolved(format!(
                        "escrow lock {} for order {} is {:?}",
                        current.id, order_id, current.status
                    )));
                }

                let amount = Amount::from_decimal(Decimal::from(current.amount))?;
                let leg = Leg::new(
                    current.account(),
                    Reference::order(order_id),
                    format!("escrow-release:{}", current.id),
                );
                let (leg, status) = match target {
                    ReleaseTarget::Seller => (
                        leg.move_funds(
                            Bucket::Locked,
                            Bucket::Available,
                            amount,
                            EntryKind::EscrowReleaseToSeller,
                        ),
                        EscrowStatus::ReleasedToSeller,
                    ),
                    ReleaseTarget::Buyer => (
                        leg.posting(Posting::debit(
                            Bucket::Locked,
                            amount,
                            EntryKind::EscrowReleaseToBuyer,
                        )),
                        EscrowStatus::ReleasedToBuyer,
                    ),
                };

                let mut next = current;
                next.status = status;
                next.resolved_at = Some(Utc::now());

                Ok(Plan::leg(leg).with_row(RowWrite::Escrow {
                    expected: Some(EscrowStatus::Active),
                    lock: next,
                }))
            })
            .await?;

        let lock = outcome.escrow_lock().cloned().ok_or_else(|| {
            Error::InvariantViolation(format!("escrow release for {} wrote no row", order_id))
        })?;

        info!(
            lock_id = %lock.id,
            order_id,
            amount = lock.amount,
            target = ?target,
            "Escrow released"
        );
        Ok(lock)
    }

    /// Latest lock of an order
    pub fn get(&self, order_id: &str) -> Result<EscrowLock> {
        self.processor
            .storage()
            .escrow_lock_for_order(order_id)?
            .ok_or_else(|| Error::NotFound(format!("escrow lock for order {}", order_id)))
    }

    /// All locks of a seller, oldest first
    pub fn list(&self, seller_id: &str) -> Result<Vec<EscrowLock>> {
        self.processor
            .storage()
            .list_escrow_locks(&AccountId::seller(seller_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics::Metrics, Config, Storage};
    use tempfile::TempDir;

    fn controller() -> (EscrowController, Arc<TransactionProcessor>, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let processor = Arc::new(TransactionProcessor::new(
            storage,
            config.retry,
            Metrics::new().unwrap(),
        ));
        (EscrowController::new(processor.clone()), processor, temp)
    }

    async fn credit_pending(processor: &TransactionProcessor, seller_id: &str, amount: i64) {
        processor
            .apply(
                &AccountId::seller(seller_id),
                Bucket::Pending,
                amount,
                EntryKind::SaleCredit,
                Reference::order("o1"),
                "sale-credit:o1",
            )
            .await
            .unwrap();
    }

    fn balance(processor: &TransactionProcessor, seller_id: &str) -> (u64, u64, u64) {
        let b = processor
            .storage()
            .current_balance(&AccountId::seller(seller_id))
            .unwrap();
        (b.available, b.pending, b.locked)
    }

    #[tokio::test]
    async fn test_lock_and_release_to_seller() {
        let (escrow, processor, _temp) = controller();
        credit_pending(&processor, "s1", 5_000).await;

        let lock = escrow.lock("s1", "o1", 5_000, EscrowSource::Pending).await.unwrap();
        assert!(lock.is_active());
        assert_eq!(balance(&processor, "s1"), (0, 0, 5_000));

        let released = escrow.release("o1", ReleaseTarget::Seller).await.unwrap();
        assert_eq!(released.id, lock.id);
        assert_eq!(released.status, EscrowStatus::ReleasedToSeller);
        assert_eq!(balance(&processor, "s1"), (5_000, 0, 0));
    }

    #[tokio::test]
    async fn test_release_to_buyer_removes_funds() {
        let (escrow, processor, _temp) = controller();
        credit_pending(&processor, "s1", 5_000).await;

        escrow.lock("s1", "o1", 2_000, EscrowSource::Pending).await.unwrap();
        escrow.release("o1", ReleaseTarget::Buyer).await.unwrap();

        assert_eq!(balance(&processor, "s1"), (0, 3_000, 0));
        assert_eq!(escrow.get("o1").unwrap().status, EscrowStatus::ReleasedToBuyer);
    }

    #[tokio::test]
    async fn test_duplicate_lock_rejected() {
        let (escrow, processor, _temp) = controller();
        credit_pending(&processor, "s1", 5_000).await;

        escrow.lock("s1", "o1", 1_000, EscrowSource::Pending).await.unwrap();
        let err = escrow
            .lock("s1", "o1", 1_000, EscrowSource::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateLock(order) if order == "o1"));
        assert_eq!(balance(&processor, "s1"), (0, 4_000, 1_000));
    }

    #[tokio::test]
    async fn test_second_release_is_already_resolved() {
        let (escrow, processor, _temp) = controller();
        credit_pending(&processor, "s1", 5_000).await;
        escrow.lock("s1", "o1", 5_000, EscrowSource::Pending).await.unwrap();

        escrow.release("o1", ReleaseTarget::Seller).await.unwrap();
        let err = escrow.release("o1", ReleaseTarget::Buyer).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyResolved(_)));
        assert_eq!(balance(&processor, "s1"), (5_000, 0, 0));
    }

    #[tokio::test]
    async fn test_release_unknown_order() {
        let (escrow, _processor, _temp) = controller();
        let err = escrow.release("missing", ReleaseTarget::Seller).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_relock_after_resolution() {
        let (escrow, processor, _temp) = controller();
        credit_pending(&processor, "s1", 5_000).await;

        let first = escrow.lock("s1", "o1", 1_000, EscrowSource::Pending).await.unwrap();
        escrow.release("o1", ReleaseTarget::Seller).await.unwrap();

        let second = escrow
            .lock("s1", "o1", 500, EscrowSource::Available)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(escrow.get("o1").unwrap().id, second.id);
        assert_eq!(escrow.list("s1").unwrap().len(), 2);
        assert_eq!(balance(&processor, "s1"), (500, 4_000, 500));
    }

    #[tokio::test]
    async fn test_lock_insufficient_funds() {
        let (escrow, processor, _temp) = controller();
        credit_pending(&processor, "s1", 100).await;

        let err = escrow
            .lock("s1", "o1", 101, EscrowSource::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));
        assert!(matches!(escrow.get("o1"), Err(Error::NotFound(_))));
    }
}
