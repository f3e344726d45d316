//! Storage ports. The ledger store is the single source of truth for wallets,
//! transactions and idempotency records; every mutation happens inside a
//! [`LedgerUnit`] that holds the wallet lock until commit or drop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{IdempotencyRecord, IdempotencyScope, Transaction, TransactionFilter, Wallet};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Timed out waiting for lock on wallet {0}")]
    LockTimeout(Uuid),

    #[error("Wallet not found: {0}")]
    WalletNotFound(Uuid),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store state poisoned")]
    Poisoned,
}

impl StoreError {
    /// Errors that are expected to clear up on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout(_) | StoreError::Database(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One atomic unit of work. Dropping it without [`LedgerUnit::commit`] discards
/// every write and releases the locks it holds.
#[async_trait]
pub trait LedgerUnit: Send {
    /// Acquires the exclusive wallet lock (bounded wait) and returns the current row.
    async fn lock_wallet(&mut self, wallet_id: Uuid) -> StoreResult<Wallet>;

    /// Atomic `balance + amount`. Returns the new balance.
    async fn credit(&mut self, wallet_id: Uuid, amount: i64) -> StoreResult<i64>;

    /// Atomic `balance - amount` applied only when `balance >= amount`.
    /// Returns `None` without mutating when funds are short.
    async fn debit_if_sufficient(&mut self, wallet_id: Uuid, amount: i64) -> StoreResult<Option<i64>>;

    async fn get_transaction(&mut self, id: Uuid) -> StoreResult<Option<Transaction>>;

    async fn insert_transaction(&mut self, tx: &Transaction) -> StoreResult<()>;

    async fn update_transaction(&mut self, tx: &Transaction) -> StoreResult<()>;

    async fn find_idempotent(&mut self, scope: &IdempotencyScope) -> StoreResult<Option<Transaction>>;

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerUnit>>;

    async fn ping(&self) -> StoreResult<()>;

    async fn insert_wallet(&self, wallet: &Wallet) -> StoreResult<Wallet>;

    async fn get_wallet(&self, id: Uuid) -> StoreResult<Option<Wallet>>;

    async fn get_transaction(&self, id: Uuid) -> StoreResult<Option<Transaction>>;

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>>;

    /// `PENDING` withdrawals with `scheduled_for <= now`, oldest first.
    async fn due_withdrawals(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Transaction>>;

    /// `FAILED` withdrawals with attempts left and `next_retry_at <= now`.
    async fn retryable_withdrawals(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>>;

    /// Withdrawals stuck in `PROCESSING` since before `older_than`.
    async fn stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>>;
}
