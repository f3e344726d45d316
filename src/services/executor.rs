//! Withdrawal Executor.
//!
//! One execution runs in three steps so the wallet lock is never held across
//! the settlement call:
//!
//! 1. reserve: lock the wallet, re-check the status, move to `PROCESSING` and
//!    debit the amount, commit;
//! 2. settle: call the settlement service under a timeout, no lock held;
//! 3. finalize: lock again and record `COMPLETED`, or refund and record `FAILED`
//!    (possibly retry-eligible), commit.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{FailureReason, Transaction, TransactionStatus};
use crate::ports::LedgerStore;
use crate::services::balance::BalanceService;
use crate::services::clock::Clock;
use crate::services::error::WalletError;
use crate::services::retry::RetryPolicy;
use crate::settlement::{SettlementClient, SettlementOutcome};

const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Not executable when re-read under the lock: duplicate dispatch, not yet
    /// due, or already terminal.
    Skipped,
    Completed,
    InsufficientBalance,
    Rejected,
    RetryScheduled {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    RetriesExhausted,
}

enum Reservation {
    Skipped,
    Insufficient,
    Reserved(Transaction),
}

pub struct WithdrawalExecutor {
    store: Arc<dyn LedgerStore>,
    settlement: Arc<dyn SettlementClient>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    settlement_timeout: Duration,
}

impl WithdrawalExecutor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settlement: Arc<dyn SettlementClient>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
        settlement_timeout: Duration,
    ) -> Self {
        Self {
            store,
            settlement,
            clock,
            retry_policy,
            settlement_timeout,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Runs one attempt of the withdrawal. Safe to call concurrently or
    /// repeatedly for the same id; at most one caller gets past the status
    /// re-check.
    pub async fn execute(&self, transaction_id: Uuid) -> Result<ExecutionOutcome, WalletError> {
        let tx = match self.reserve(transaction_id).await? {
            Reservation::Skipped => return Ok(ExecutionOutcome::Skipped),
            Reservation::Insufficient => return Ok(ExecutionOutcome::InsufficientBalance),
            Reservation::Reserved(tx) => tx,
        };

        let outcome = self.settle(&tx).await;
        info!(
            transaction_id = %tx.id,
            wallet_id = %tx.wallet_id,
            outcome = outcome.label(),
            "Settlement returned"
        );

        self.finalize_with_retry(&tx, &outcome).await
    }

    async fn reserve(&self, transaction_id: Uuid) -> Result<Reservation, WalletError> {
        let snapshot = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(WalletError::TransactionNotFound(transaction_id))?;
        if !snapshot.is_withdrawal() {
            return Ok(Reservation::Skipped);
        }

        let mut unit = self.store.begin().await?;
        unit.lock_wallet(snapshot.wallet_id).await?;

        let mut tx = unit
            .get_transaction(transaction_id)
            .await?
            .ok_or(WalletError::TransactionNotFound(transaction_id))?;

        let now = self.clock.now();
        if !tx.is_executable(self.retry_policy.max_retries, now) {
            debug!(
                transaction_id = %tx.id,
                status = %tx.status,
                "Withdrawal not executable, skipping"
            );
            return Ok(Reservation::Skipped);
        }

        tx.begin_attempt(now)?;
        match BalanceService::reserve_for_withdrawal(unit.as_mut(), tx.wallet_id, tx.amount).await {
            Ok(balance) => {
                unit.update_transaction(&tx).await?;
                unit.commit().await?;
                info!(
                    transaction_id = %tx.id,
                    wallet_id = %tx.wallet_id,
                    amount = tx.amount,
                    balance,
                    retry_count = tx.retry_count,
                    "Withdrawal reserved, settling"
                );
                Ok(Reservation::Reserved(tx))
            }
            Err(WalletError::InsufficientBalance { available, .. }) => {
                tx.fail(
                    now,
                    FailureReason::InsufficientBalance,
                    None,
                    json!({ "error": "insufficient balance", "available": available }),
                )?;
                unit.update_transaction(&tx).await?;
                unit.commit().await?;
                warn!(
                    transaction_id = %tx.id,
                    wallet_id = %tx.wallet_id,
                    amount = tx.amount,
                    available,
                    "Withdrawal failed: insufficient balance"
                );
                Ok(Reservation::Insufficient)
            }
            Err(e) => Err(e),
        }
    }

    async fn settle(&self, tx: &Transaction) -> SettlementOutcome {
        match tokio::time::timeout(self.settlement_timeout, self.settlement.settle(tx.id, tx.amount)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    transaction_id = %tx.id,
                    timeout_ms = self.settlement_timeout.as_millis() as u64,
                    "Settlement call timed out"
                );
                SettlementOutcome::TransientFailure(json!({
                    "error": "settlement timed out",
                    "timeout_ms": self.settlement_timeout.as_millis() as u64,
                }))
            }
        }
    }

    async fn finalize_with_retry(
        &self,
        tx: &Transaction,
        outcome: &SettlementOutcome,
    ) -> Result<ExecutionOutcome, WalletError> {
        let mut attempt = 1;
        loop {
            match self.finalize(tx, outcome).await {
                Err(e) if e.is_transient() && attempt < FINALIZE_ATTEMPTS => {
                    warn!(
                        transaction_id = %tx.id,
                        attempt,
                        error = %e,
                        "Finalization failed, retrying"
                    );
                    tokio::time::sleep(FINALIZE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        transaction_id = %tx.id,
                        wallet_id = %tx.wallet_id,
                        outcome = outcome.label(),
                        error = %e,
                        "Could not finalize withdrawal; it stays PROCESSING until reconciled"
                    );
                    return Err(e);
                }
                result => return result,
            }
        }
    }

    async fn finalize(
        &self,
        reserved: &Transaction,
        outcome: &SettlementOutcome,
    ) -> Result<ExecutionOutcome, WalletError> {
        let mut unit = self.store.begin().await?;
        unit.lock_wallet(reserved.wallet_id).await?;

        let mut tx = unit
            .get_transaction(reserved.id)
            .await?
            .ok_or(WalletError::TransactionNotFound(reserved.id))?;
        if tx.status != TransactionStatus::Processing {
            warn!(
                transaction_id = %tx.id,
                status = %tx.status,
                "Withdrawal left PROCESSING before finalization"
            );
            return Ok(ExecutionOutcome::Skipped);
        }

        let now = self.clock.now();
        let result = match outcome {
            SettlementOutcome::Success(detail) => {
                tx.complete(now, detail.clone())?;
                info!(
                    transaction_id = %tx.id,
                    wallet_id = %tx.wallet_id,
                    amount = tx.amount,
                    "Withdrawal completed"
                );
                ExecutionOutcome::Completed
            }
            SettlementOutcome::Rejected(detail) => {
                BalanceService::refund(unit.as_mut(), tx.wallet_id, tx.amount).await?;
                tx.fail(now, FailureReason::Rejected, None, detail.clone())?;
                warn!(
                    transaction_id = %tx.id,
                    wallet_id = %tx.wallet_id,
                    "Withdrawal rejected by settlement service"
                );
                ExecutionOutcome::Rejected
            }
            SettlementOutcome::TransientFailure(detail) => {
                BalanceService::refund(unit.as_mut(), tx.wallet_id, tx.amount).await?;
                tx.retry_count += 1;
                if self.retry_policy.allows_retry(tx.retry_count) {
                    let next_retry_at = self.retry_policy.next_retry_at(now, tx.retry_count);
                    tx.fail(now, FailureReason::TransientFailure, Some(next_retry_at), detail.clone())?;
                    warn!(
                        transaction_id = %tx.id,
                        wallet_id = %tx.wallet_id,
                        retry_count = tx.retry_count,
                        next_retry_at = %next_retry_at,
                        "Withdrawal failed transiently, retry scheduled"
                    );
                    ExecutionOutcome::RetryScheduled {
                        retry_count: tx.retry_count,
                        next_retry_at,
                    }
                } else {
                    tx.fail(now, FailureReason::RetriesExhausted, None, detail.clone())?;
                    warn!(
                        transaction_id = %tx.id,
                        wallet_id = %tx.wallet_id,
                        retry_count = tx.retry_count,
                        "Withdrawal failed, retries exhausted"
                    );
                    ExecutionOutcome::RetriesExhausted
                }
            }
        };

        unit.update_transaction(&tx).await?;
        unit.commit().await?;
        Ok(result)
    }
}
