//! Atomic per-subject allowance ledger.

use std::sync::Arc;

use chrono::Utc;

use draftflow_core::allowance::{AllowanceAccount, Balance, CreditMode};
use draftflow_core::error::{DraftflowError, Result};
use draftflow_core::retry::RetryPolicy;
use draftflow_core::store::AllowanceStore;

use crate::store_retry::with_store_retry;

/// Check-and-deduct and refund of allowance units.
///
/// Each mutation is one conditional statement in the store, so concurrent
/// callers for the same subject can never overdraw it. Deducts and credits
/// run once: a transient error may hide a committed change, so it is
/// surfaced instead of retried. Reads and the idempotent account upsert
/// are retried. Workflow charges do not go through here; the engine
/// commits them with the instance transition.
pub struct AllowanceLedger {
    store: Arc<dyn AllowanceStore>,
    retry: RetryPolicy,
}

impl AllowanceLedger {
    pub fn new(store: Arc<dyn AllowanceStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Deduct `amount` units.
    ///
    /// Fails with `InsufficientAllowance` when the balance does not cover
    /// it (or no account exists), leaving the account untouched.
    pub async fn deduct(&self, subject_id: &str, amount: i64) -> Result<Balance> {
        require_positive(amount)?;

        let account = self.store.deduct(subject_id, amount, Utc::now()).await?;

        match account {
            Some(account) => {
                tracing::debug!(
                    subject_id = %subject_id,
                    amount,
                    remaining = %account.remaining(),
                    "Allowance deducted"
                );
                Ok(account.remaining())
            }
            None => {
                tracing::debug!(subject_id = %subject_id, amount, "Insufficient allowance");
                Err(DraftflowError::InsufficientAllowance {
                    subject_id: subject_id.to_string(),
                    instance_id: None,
                })
            }
        }
    }

    /// Give back `amount` units after a failed downstream step. No-op for
    /// unlimited accounts.
    pub async fn refund(&self, subject_id: &str, amount: i64) -> Result<Balance> {
        self.credit(subject_id, amount, CreditMode::Refund).await
    }

    /// Top up an account, e.g. after a purchase.
    pub async fn grant(&self, subject_id: &str, amount: i64) -> Result<Balance> {
        self.credit(subject_id, amount, CreditMode::Grant).await
    }

    /// Create an account, or raise an existing one to at least
    /// `initial_balance`. Never lowers a balance.
    pub async fn open_account(
        &self,
        subject_id: &str,
        initial_balance: i64,
        unlimited: bool,
    ) -> Result<AllowanceAccount> {
        if initial_balance < 0 {
            return Err(DraftflowError::Validation(
                "initial balance must not be negative".into(),
            ));
        }

        let account = with_store_retry(&self.retry, |_| {
            self.store
                .upsert_account(subject_id, initial_balance, unlimited, Utc::now())
        })
        .await?;

        tracing::info!(
            subject_id = %subject_id,
            balance = account.balance,
            unlimited = account.unlimited,
            "Allowance account opened"
        );
        Ok(account)
    }

    /// Current balance. A subject without an account has nothing.
    pub async fn balance(&self, subject_id: &str) -> Result<Balance> {
        Ok(self
            .account(subject_id)
            .await?
            .map_or(Balance::Limited(0), |a| a.remaining()))
    }

    pub async fn account(&self, subject_id: &str) -> Result<Option<AllowanceAccount>> {
        with_store_retry(&self.retry, |_| self.store.get_account(subject_id)).await
    }

    async fn credit(&self, subject_id: &str, amount: i64, mode: CreditMode) -> Result<Balance> {
        require_positive(amount)?;

        let account = self
            .store
            .credit(subject_id, amount, mode, Utc::now())
            .await?
            .ok_or_else(|| {
                DraftflowError::NotFound(format!("allowance account for subject {}", subject_id))
            })?;

        tracing::info!(
            subject_id = %subject_id,
            amount,
            mode = ?mode,
            remaining = %account.remaining(),
            "Allowance credited"
        );
        Ok(account.remaining())
    }
}

fn require_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(DraftflowError::Validation(
            "amount must be greater than zero".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use draftflow_core::testing::MemoryStore;
    use draftflow_core::{assert_err_variant, assert_ok};

    use super::*;

    fn ledger(store: Arc<MemoryStore>) -> AllowanceLedger {
        AllowanceLedger::new(
            store,
            RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_deduct_until_empty() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store);
        ledger.open_account("user-1", 2, false).await.unwrap();

        assert_eq!(ledger.deduct("user-1", 1).await.unwrap(), Balance::Limited(1));
        assert_eq!(ledger.deduct("user-1", 1).await.unwrap(), Balance::Limited(0));
        let result = ledger.deduct("user-1", 1).await;
        assert_err_variant!(result, DraftflowError::InsufficientAllowance { .. });
        assert_eq!(ledger.balance("user-1").await.unwrap(), Balance::Limited(0));
    }

    #[tokio::test]
    async fn test_missing_account_has_no_allowance() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        let result = ledger.deduct("ghost", 1).await;
        assert_err_variant!(result, DraftflowError::InsufficientAllowance { .. });
        assert_eq!(ledger.balance("ghost").await.unwrap(), Balance::Limited(0));
        assert_err_variant!(ledger.refund("ghost", 1).await, DraftflowError::NotFound(_));
    }

    #[tokio::test]
    async fn test_unlimited_account_is_never_debited() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        ledger.open_account("admin", 0, true).await.unwrap();

        for _ in 0..3 {
            assert_eq!(ledger.deduct("admin", 1).await.unwrap(), Balance::Unlimited);
        }
        assert_ok!(ledger.refund("admin", 1).await);
        let account = ledger.account("admin").await.unwrap().unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.version, 0);
    }

    #[tokio::test]
    async fn test_refund_and_grant() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        ledger.open_account("user-1", 1, false).await.unwrap();
        ledger.deduct("user-1", 1).await.unwrap();

        assert_eq!(ledger.refund("user-1", 1).await.unwrap(), Balance::Limited(1));
        assert_eq!(ledger.grant("user-1", 5).await.unwrap(), Balance::Limited(6));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amounts() {
        let ledger = ledger(Arc::new(MemoryStore::new()));
        assert_err_variant!(ledger.deduct("u", 0).await, DraftflowError::Validation(_));
        assert_err_variant!(ledger.grant("u", -1).await, DraftflowError::Validation(_));
        assert_err_variant!(
            ledger.open_account("u", -1, false).await,
            DraftflowError::Validation(_)
        );
    }

    #[tokio::test]
    async fn test_transient_errors_retry_reads_only() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());
        ledger.open_account("user-1", 1, false).await.unwrap();

        store.inject_transient_failures(2);
        assert_eq!(ledger.balance("user-1").await.unwrap(), Balance::Limited(1));

        store.inject_transient_failures(1);
        assert_err_variant!(ledger.grant("user-1", 1).await, DraftflowError::TransientStore(_));
        assert_eq!(ledger.balance("user-1").await.unwrap(), Balance::Limited(1));
        assert!(store.credits().is_empty());
    }

    #[tokio::test]
    async fn test_persistent_store_errors_surface() {
        let store = Arc::new(MemoryStore::new());
        let ledger = ledger(store.clone());

        store.inject_transient_failures(10);
        let result = ledger.balance("user-1").await;
        assert_err_variant!(result, DraftflowError::RetryExhausted { attempts: 3, .. });
    }
}
