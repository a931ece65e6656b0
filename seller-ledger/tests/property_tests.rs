//! Property-based tests for ledger invariants
//!
//! Random operation sequences are applied to a fresh ledger, then:
//! - Conservation: bucket sum == Σ entry deltas, per account
//! - Non-negativity and chain integrity: every account audits clean
//! - Idempotency: resubmitting an operation never changes balances
//! - Locked funds always match open withdrawals plus active escrow

use proptest::prelude::*;
use seller_ledger::{
    AccountId, BalanceSnapshot, BankDetails, Config, Error, Ledger, ReleaseTarget,
    WithdrawalMethod,
};
use std::collections::HashMap;
use tempfile::TempDir;
use uuid::Uuid;

const SELLER: &str = "seller-1";
const WALLET: &str = "wallet-1";

#[derive(Debug, Clone)]
enum Op {
    CreditSale { order: u8, amount: u64 },
    ReleasePending { order: u8, amount: u64 },
    CreateWithdrawal { amount: u64, fast: bool },
    ApproveWithdrawal { pick: usize },
    SettleWithdrawal { pick: usize },
    RejectWithdrawal { pick: usize },
    FailWithdrawal { pick: usize },
    LockEscrow { order: u8, amount: u64 },
    ReleaseEscrow { order: u8, to_seller: bool },
    Transfer { amount: u64 },
    Boost { id: u8, amount: u64 },
}

/// Strategy for generating amounts in minor units
fn amount_strategy() -> impl Strategy<Value = u64> {
    1u64..50_000
}

/// Strategy for generating ledger operations
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..8, amount_strategy()).prop_map(|(order, amount)| Op::CreditSale { order, amount }),
        2 => (0u8..8, amount_strategy()).prop_map(|(order, amount)| Op::ReleasePending { order, amount }),
        2 => (amount_strategy(), any::<bool>()).prop_map(|(amount, fast)| Op::CreateWithdrawal { amount, fast }),
        1 => any::<usize>().prop_map(|pick| Op::ApproveWithdrawal { pick }),
        1 => any::<usize>().prop_map(|pick| Op::SettleWithdrawal { pick }),
        1 => any::<usize>().prop_map(|pick| Op::RejectWithdrawal { pick }),
        1 => any::<usize>().prop_map(|pick| Op::FailWithdrawal { pick }),
        1 => (0u8..8, amount_strategy()).prop_map(|(order, amount)| Op::LockEscrow { order, amount }),
        1 => (0u8..8, any::<bool>()).prop_map(|(order, to_seller)| Op::ReleaseEscrow { order, to_seller }),
        1 => amount_strategy().prop_map(|amount| Op::Transfer { amount }),
        1 => (0u8..4, amount_strategy()).prop_map(|(id, amount)| Op::Boost { id, amount }),
    ]
}

/// Create test ledger with temp directory
async fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.ledger_page_size = 16;
    config.withdrawal.fast_auto_approve_limit = Some(10_000);

    (Ledger::open(config).await.unwrap(), temp_dir)
}

/// Errors a well-formed caller can legitimately receive
fn is_business_error(e: &Error) -> bool {
    matches!(
        e,
        Error::InsufficientFunds { .. }
            | Error::DuplicateLock(_)
            | Error::AlreadyResolved(_)
            | Error::NotFound(_)
            | Error::NotPending(_)
            | Error::NotApproved(_)
            | Error::IdempotencyMismatch { .. }
    )
}

fn chosen(withdrawals: &[Uuid], pick: usize) -> Option<Uuid> {
    withdrawals.get(pick % withdrawals.len().max(1)).copied()
}

async fn run_op(ledger: &Ledger, withdrawals: &mut Vec<Uuid>, op: &Op) -> Result<(), Error> {
    match op {
        Op::CreditSale { order, amount } => {
            ledger.credit_sale(SELLER, &format!("o{}", order), *amount).await?;
        }
        Op::ReleasePending { order, amount } => {
            ledger.release_pending(SELLER, &format!("o{}", order), *amount).await?;
        }
        Op::CreateWithdrawal { amount, fast } => {
            let method = if *fast {
                WithdrawalMethod::Fast
            } else {
                WithdrawalMethod::Normal
            };
            let id = ledger
                .create_withdrawal(SELLER, *amount, method, BankDetails::default())
                .await?;
            withdrawals.push(id);
        }
        Op::ApproveWithdrawal { pick: p } => {
            if let Some(id) = chosen(withdrawals, *p) {
                ledger.approve_withdrawal(id).await?;
            }
        }
        Op::SettleWithdrawal { pick: p } => {
            if let Some(id) = chosen(withdrawals, *p) {
                ledger.settle_withdrawal(id).await?;
            }
        }
        Op::RejectWithdrawal { pick: p } => {
            if let Some(id) = chosen(withdrawals, *p) {
                ledger.reject_withdrawal(id, "rejected by property test").await?;
            }
        }
        Op::FailWithdrawal { pick: p } => {
            if let Some(id) = chosen(withdrawals, *p) {
                ledger.fail_withdrawal(id, "payout failed").await?;
            }
        }
        Op::LockEscrow { order, amount } => {
            ledger.lock_escrow(SELLER, &format!("o{}", order), *amount).await?;
        }
        Op::ReleaseEscrow { order, to_seller } => {
            let to = if *to_seller {
                ReleaseTarget::Seller
            } else {
                ReleaseTarget::Buyer
            };
            ledger.release_escrow(&format!("o{}", order), to).await?;
        }
        Op::Transfer { amount } => {
            ledger.transfer_to_user_wallet(SELLER, WALLET, *amount).await?;
        }
        Op::Boost { id, amount } => {
            ledger.purchase_boost(SELLER, &format!("b{}", id), *amount).await?;
        }
    }
    Ok(())
}

fn delta_sums(ledger: &Ledger, account: &AccountId) -> i128 {
    ledger
        .get_ledger(account, 0)
        .map(|e| e.unwrap().delta as i128)
        .sum()
}

fn total(b: &BalanceSnapshot) -> i128 {
    b.available as i128 + b.pending as i128 + b.locked as i128
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: every reachable state conserves money and audits clean
    #[test]
    fn prop_random_operations_preserve_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            let mut withdrawals = Vec::new();

            for op in &ops {
                let before = ledger.get_balance(SELLER).unwrap();
                match run_op(&ledger, &mut withdrawals, op).await {
                    Ok(()) => {}
                    Err(e) => {
                        prop_assert!(is_business_error(&e), "unexpected error {:?} for {:?}", e, op);
                        // A rejected operation leaves the seller untouched
                        prop_assert_eq!(ledger.get_balance(SELLER).unwrap(), before);
                    }
                }
            }

            for account in [AccountId::seller(SELLER), AccountId::user_wallet(WALLET)] {
                let balance = ledger.get_account_balance(&account).unwrap();
                prop_assert_eq!(total(&balance), delta_sums(&ledger, &account));
            }

            for report in ledger.audit_all().unwrap() {
                prop_assert!(report.is_clean(), "{}: {:?}", report.account, report.violations);
            }
            Ok(())
        })?;
    }

    /// Property: entry n starts where entry n-1 of the same bucket ended
    #[test]
    fn prop_chain_integrity(amounts in prop::collection::vec(amount_strategy(), 1..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            for (i, amount) in amounts.iter().enumerate() {
                let order = format!("o{}", i);
                ledger.credit_sale(SELLER, &order, *amount).await.unwrap();
                if i % 2 == 0 {
                    ledger.release_pending(SELLER, &order, *amount).await.unwrap();
                }
            }

            let mut last_after: HashMap<_, u64> = HashMap::new();
            let mut expected_id = 1;
            for entry in ledger.get_ledger(&AccountId::seller(SELLER), 0) {
                let entry = entry.unwrap();
                prop_assert_eq!(entry.id, expected_id);
                let previous = last_after.get(&entry.bucket).copied().unwrap_or(0);
                prop_assert_eq!(entry.balance_before, previous);
                prop_assert_eq!(
                    entry.balance_after as i128,
                    entry.balance_before as i128 + entry.delta as i128
                );
                last_after.insert(entry.bucket, entry.balance_after);
                expected_id += 1;
            }
            Ok(())
        })?;
    }

    /// Property: resubmitting an operation yields the balance of applying it once
    #[test]
    fn prop_idempotent_resubmission(amount in amount_strategy(), repeats in 1usize..5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;

            ledger.credit_sale(SELLER, "o1", amount).await.unwrap();
            let once = ledger.get_balance(SELLER).unwrap();

            for _ in 0..repeats {
                let replay = ledger.credit_sale(SELLER, "o1", amount).await.unwrap();
                prop_assert!(replay.replayed);
            }
            prop_assert_eq!(ledger.get_balance(SELLER).unwrap(), once);

            ledger.release_pending(SELLER, "o1", amount).await.unwrap();
            ledger
                .transfer_to_user_wallet_with_key(SELLER, WALLET, amount, "t1")
                .await
                .unwrap();
            let seller_once = ledger.get_balance(SELLER).unwrap();
            let wallet_once = ledger.get_wallet_balance(WALLET).unwrap();

            for _ in 0..repeats {
                let receipt = ledger
                    .transfer_to_user_wallet_with_key(SELLER, WALLET, amount, "t1")
                    .await
                    .unwrap();
                prop_assert!(receipt.replayed);
            }
            prop_assert_eq!(ledger.get_balance(SELLER).unwrap(), seller_once);
            prop_assert_eq!(ledger.get_wallet_balance(WALLET).unwrap(), wallet_once);
            Ok(())
        })?;
    }

    /// Property: overdrawing any bucket fails and changes nothing
    #[test]
    fn prop_overdraw_rejected(funded in amount_strategy(), extra in 1u64..1_000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger().await;
            ledger.credit_sale(SELLER, "o1", funded).await.unwrap();
            ledger.release_pending(SELLER, "o1", funded).await.unwrap();
            let before = ledger.get_balance(SELLER).unwrap();

            let err = ledger
                .create_withdrawal(SELLER, funded + extra, WithdrawalMethod::Normal, BankDetails::default())
                .await
                .unwrap_err();
            prop_assert!(
                matches!(err, Error::InsufficientFunds { .. }),
                "unexpected error: {:?}",
                err
            );

            let err = ledger.transfer_to_user_wallet(SELLER, WALLET, funded + extra).await.unwrap_err();
            prop_assert!(
                matches!(err, Error::InsufficientFunds { .. }),
                "unexpected error: {:?}",
                err
            );

            prop_assert_eq!(ledger.get_balance(SELLER).unwrap(), before);
            prop_assert_eq!(ledger.get_wallet_balance(WALLET).unwrap(), BalanceSnapshot::default());
            Ok(())
        })?;
    }
}
