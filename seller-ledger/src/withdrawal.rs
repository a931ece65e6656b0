//! Withdrawal workflow
//!
//! ```text
//! pending ──approve──► approved ──settle──► settled
//!    │                    │
//!    └──reject──► rejected └──fail──► failed
//! ```
//!
//! Every transition commits the request row and its ledger postings in one
//! batch, with the prior status re-checked under the seller latch.

use crate::{
    config::WithdrawalPolicy,
    metrics::Metrics,
    processor::{Applied, Leg, Plan, Posting, RowWrite, TransactionProcessor},
    types::{
        AccountId, Amount, BankDetails, Bucket, EntryKind, Reference, ReferenceType,
        WithdrawalMethod, WithdrawalRequest, WithdrawalStatus,
    },
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Withdrawal workflow
#[derive(Debug)]
pub struct WithdrawalWorkflow {
    processor: Arc<TransactionProcessor>,
    policy: WithdrawalPolicy,
    metrics: Metrics,
}

impl WithdrawalWorkflow {
    /// Create workflow
    pub fn new(processor: Arc<TransactionProcessor>, policy: WithdrawalPolicy, metrics: Metrics) -> Self {
        Self {
            processor,
            policy,
            metrics,
        }
    }

    /// Create a request and lock its amount.
    ///
    /// The request row and the available → locked move commit together.
    /// Fast requests within the auto-approve limit are created `approved`.
    pub async fn create(
        &self,
        seller_id: &str,
        amount: impl Into<Decimal>,
        method: WithdrawalMethod,
        bank_details: BankDetails,
    ) -> Result<WithdrawalRequest> {
        let id = Uuid::now_v7();
        self.create_as(id, lock_key(id), seller_id, amount, method, bank_details)
            .await
    }

    /// Same as [`WithdrawalWorkflow::create`], keyed by the caller.
    ///
    /// Resubmitting with the same `request_key` returns the request created
    /// by the first call without locking funds again.
    pub async fn create_with_key(
        &self,
        seller_id: &str,
        amount: impl Into<Decimal>,
        method: WithdrawalMethod,
        bank_details: BankDetails,
        request_key: &str,
    ) -> Result<WithdrawalRequest> {
        let key = format!("withdrawal-request:{}", request_key);
        self.create_as(Uuid::now_v7(), key, seller_id, amount, method, bank_details)
            .await
    }

    async fn create_as(
        &self,
        id: Uuid,
        key: String,
        seller_id: &str,
        amount: impl Into<Decimal>,
        method: WithdrawalMethod,
        bank_details: BankDetails,
    ) -> Result<WithdrawalRequest> {
        let amount = Amount::from_decimal(amount.into())?;

        let status = if self.auto_approves(method, amount) {
            WithdrawalStatus::Approved
        } else {
            WithdrawalStatus::Pending
        };

        let request = WithdrawalRequest {
            id,
            seller_id: seller_id.to_string(),
            amount: amount.get(),
            method,
            bank_details,
            status,
            created_at: Utc::now(),
            resolved_at: None,
            resolution_reason: None,
        };

        let account = request.account();
        let leg = Leg::new(account.clone(), reference(id), key.clone()).move_funds(
            Bucket::Available,
            Bucket::Locked,
            amount,
            EntryKind::WithdrawalLock,
        );

        let outcome = self
            .processor
            .execute("create-withdrawal", |storage| {
                // Already created: replay the lock leg alone
                if storage.get_idempotency(&account, &key)?.is_some() {
                    return Ok(Plan::leg(leg.clone()));
                }
                Ok(Plan::leg(leg.clone()).with_row(RowWrite::Withdrawal {
                    expected: None,
                    request: request.clone(),
                }))
            })
            .await?;

        if outcome.withdrawal().is_none() {
            let existing = replayed_request_id(&outcome.legs)?;
            tracing::debug!(withdrawal_id = %existing, key = %key, "Withdrawal create replayed");
            return self.get(existing);
        }

        self.metrics
            .record_withdrawal_transition(WithdrawalStatus::Pending);
        if status == WithdrawalStatus::Approved {
            self.metrics
                .record_withdrawal_transition(WithdrawalStatus::Approved);
        }

        info!(
            withdrawal_id = %id,
            seller_id,
            amount = amount.get(),
            method = ?method,
            status = status.as_str(),
            "Withdrawal created"
        );
        Ok(request)
    }

    /// `pending → approved`
    pub async fn approve(&self, id: Uuid) -> Result<WithdrawalRequest> {
        self.transition(id, WithdrawalStatus::Approved, None).await
    }

    /// `approved → settled`; the locked amount leaves the ledger
    pub async fn settle(&self, id: Uuid) -> Result<WithdrawalRequest> {
        self.transition(id, WithdrawalStatus::Settled, None).await
    }

    /// `pending → rejected`; the locked amount returns to available
    pub async fn reject(&self, id: Uuid, reason: &str) -> Result<WithdrawalRequest> {
        self.transition(id, WithdrawalStatus::Rejected, Some(reason.to_string()))
            .await
    }

    /// `approved → failed`; the locked amount returns to available
    pub async fn fail(&self, id: Uuid, reason: &str) -> Result<WithdrawalRequest> {
        self.transition(id, WithdrawalStatus::Failed, Some(reason.to_string()))
            .await
    }

    /// Get request by id
    pub fn get(&self, id: Uuid) -> Result<WithdrawalRequest> {
        self.processor
            .storage()
            .get_withdrawal(id)?
            .ok_or_else(|| Error::NotFound(format!("withdrawal {}", id)))
    }

    /// All requests of a seller, oldest first
    pub fn list(&self, seller_id: &str) -> Result<Vec<WithdrawalRequest>> {
        self.processor
            .storage()
            .list_withdrawals(&AccountId::seller(seller_id))
    }

    fn auto_approves(&self, method: WithdrawalMethod, amount: Amount) -> bool {
        match (method, self.policy.fast_auto_approve_limit) {
            (WithdrawalMethod::Fast, Some(limit)) => amount.get() <= limit,
            _ => false,
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        target: WithdrawalStatus,
        reason: Option<String>,
    ) -> Result<WithdrawalRequest> {
        let operation = match target {
            WithdrawalStatus::Approved => "approve-withdrawal",
            WithdrawalStatus::Settled => "settle-withdrawal",
            WithdrawalStatus::Rejected => "reject-withdrawal",
            WithdrawalStatus::Failed => "fail-withdrawal",
            WithdrawalStatus::Pending => {
                return Err(Error::InvariantViolation(
                    "withdrawals never return to pending".to_string(),
                ))
            }
        };

        let outcome = self
            .processor
            .execute(operation, |storage| {
                let current = storage
                    .get_withdrawal(id)?
                    .ok_or_else(|| Error::NotFound(format!("withdrawal {}", id)))?;
                check_transition(&current, target)?;

                let mut next = current.clone();
                next.status = target;
                if target.is_terminal() {
                    next.resolved_at = Some(Utc::now());
                    next.resolution_reason = reason.clone();
                }

                let legs = match postings(&current, target)? {
                    Some(leg) => vec![leg],
                    None => Vec::new(),
                };

                Ok(Plan {
                    legs,
                    rows: vec![RowWrite::Withdrawal {
                        expected: Some(current.status),
                        request: next,
                    }],
                })
            })
            .await?;

        let request = outcome.withdrawal().cloned().ok_or_else(|| {
            Error::InvariantViolation(format!("withdrawal {} transition wrote no row", id))
        })?;

        self.metrics.record_withdrawal_transition(target);
        info!(
            withdrawal_id = %id,
            seller_id = %request.seller_id,
            amount = request.amount,
            status = target.as_str(),
            reason = request.resolution_reason.as_deref().unwrap_or(""),
            "Withdrawal transitioned"
        );
        Ok(request)
    }
}

fn check_transition(current: &WithdrawalRequest, target: WithdrawalStatus) -> Result<()> {
    use WithdrawalStatus::*;

    let already_resolved = || {
        Error::AlreadyResolved(format!(
            "withdrawal {} is {}",
            current.id,
            current.status.as_str()
        ))
    };

    match (current.status, target) {
        (Pending, Approved) | (Approved, Settled) | (Pending, Rejected) | (Approved, Failed) => Ok(()),
        (_, Approved) => Err(Error::NotPending(current.id)),
        (_, Settled) => Err(Error::NotApproved(current.id)),
        (status, Rejected | Failed) if status.is_terminal() => Err(already_resolved()),
        (Approved, Rejected) => Err(Error::NotPending(current.id)),
        (Pending, Failed) => Err(Error::NotApproved(current.id)),
        (_, _) => Err(Error::InvariantViolation(format!(
            "withdrawal {} cannot move from {} to {}",
            current.id,
            current.status.as_str(),
            target.as_str()
        ))),
    }
}

/// Ledger leg backing a transition, if it moves money
fn postings(request: &WithdrawalRequest, target: WithdrawalStatus) -> Result<Option<Leg>> {
    let amount = Amount::from_decimal(Decimal::from(request.amount))?;
    let leg = match target {
        WithdrawalStatus::Settled => Leg::new(request.account(), reference(request.id), settle_key(request.id))
            .posting(Posting::debit(Bucket::Locked, amount, EntryKind::WithdrawalSettle)),
        WithdrawalStatus::Rejected | WithdrawalStatus::Failed => {
            Leg::new(request.account(), reference(request.id), release_key(request.id)).move_funds(
                Bucket::Locked,
                Bucket::Available,
                amount,
                EntryKind::WithdrawalRelease,
            )
        }
        WithdrawalStatus::Pending | WithdrawalStatus::Approved => return Ok(None),
    };
    Ok(Some(leg))
}

/// Request id recorded on the entries of a replayed lock leg
fn replayed_request_id(legs: &[Applied]) -> Result<Uuid> {
    legs.first()
        .and_then(|leg| leg.entries.first())
        .and_then(|entry| Uuid::parse_str(&entry.reference.reference_id).ok())
        .ok_or_else(|| {
            Error::InvariantViolation("replayed withdrawal lock has no request id".to_string())
        })
}

fn reference(id: Uuid) -> Reference {
    Reference::new(ReferenceType::Withdrawal, id.to_string())
}

fn lock_key(id: Uuid) -> String {
    format!("withdrawal-lock:{}", id)
}

fn settle_key(id: Uuid) -> String {
    format!("withdrawal-settle:{}", id)
}

fn release_key(id: Uuid) -> String {
    format!("withdrawal-release:{}", id)
}
