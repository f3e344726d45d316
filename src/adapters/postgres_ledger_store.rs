//! Postgres implementation of the ledger ports.
//!
//! A unit of work is a database transaction. Wallet locks are row locks taken
//! with `SELECT ... FOR UPDATE` under a transaction-local `lock_timeout`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    FailureReason, IdempotencyRecord, IdempotencyScope, Transaction, TransactionFilter, Wallet,
};
use crate::ports::{LedgerStore, LedgerUnit, StoreError, StoreResult};

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

const TRANSACTION_COLUMNS: &str = "id, wallet_id, amount, transaction_type, status, scheduled_for, \
     executed_at, retry_count, next_retry_at, failure_reason, settlement_response, \
     idempotency_key, created_at, updated_at";

/// Postgres-backed ledger store.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn sql_state(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn map_lock_error(err: sqlx::Error, wallet_id: Uuid) -> StoreError {
    if sql_state(&err).as_deref() == Some(LOCK_NOT_AVAILABLE) {
        StoreError::LockTimeout(wallet_id)
    } else {
        StoreError::Database(err)
    }
}

fn rows_into_domain(rows: Vec<TransactionRow>) -> StoreResult<Vec<Transaction>> {
    rows.into_iter().map(TransactionRow::into_domain).collect()
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerUnit>> {
        let mut tx = self.pool.begin().await?;
        // SET does not accept bind parameters.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        Ok(Box::new(PostgresUnit { tx }))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> StoreResult<Wallet> {
        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            INSERT INTO wallets (id, balance, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, balance, created_at, updated_at
            "#,
        )
        .bind(wallet.id)
        .bind(wallet.balance)
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_wallet(&self, id: Uuid) -> StoreResult<Option<Wallet>> {
        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT id, balance, created_at, updated_at FROM wallets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_transaction(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE wallet_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR transaction_type = $3)
            ORDER BY created_at DESC
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.transaction_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows_into_domain(rows)
    }

    async fn due_withdrawals(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE transaction_type = 'WITHDRAWAL'
              AND status = 'PENDING'
              AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            LIMIT $2
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows_into_domain(rows)
    }

    async fn retryable_withdrawals(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE transaction_type = 'WITHDRAWAL'
              AND status = 'FAILED'
              AND retry_count < $2
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $3
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(now)
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows_into_domain(rows)
    }

    async fn stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE transaction_type = 'WITHDRAWAL'
              AND status = 'PROCESSING'
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows_into_domain(rows)
    }
}

struct PostgresUnit {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerUnit for PostgresUnit {
    async fn lock_wallet(&mut self, wallet_id: Uuid) -> StoreResult<Wallet> {
        let row = sqlx::query_as::<_, WalletRow>(
            "SELECT id, balance, created_at, updated_at FROM wallets WHERE id = $1 FOR UPDATE",
        )
        .bind(wallet_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_lock_error(e, wallet_id))?;

        row.map(Into::into).ok_or(StoreError::WalletNotFound(wallet_id))
    }

    async fn credit(&mut self, wallet_id: Uuid, amount: i64) -> StoreResult<i64> {
        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE wallets SET balance = balance + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING balance
            "#,
        )
        .bind(wallet_id)
        .bind(amount)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_lock_error(e, wallet_id))?;

        balance.ok_or(StoreError::WalletNotFound(wallet_id))
    }

    async fn debit_if_sufficient(&mut self, wallet_id: Uuid, amount: i64) -> StoreResult<Option<i64>> {
        let balance = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE wallets SET balance = balance - $2, updated_at = NOW()
            WHERE id = $1 AND balance >= $2
            RETURNING balance
            "#,
        )
        .bind(wallet_id)
        .bind(amount)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_lock_error(e, wallet_id))?;

        Ok(balance)
    }

    async fn get_transaction(&mut self, id: Uuid) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn insert_transaction(&mut self, tx: &Transaction) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO transactions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(tx.id)
        .bind(tx.wallet_id)
        .bind(tx.amount)
        .bind(tx.transaction_type.as_str())
        .bind(tx.status.as_str())
        .bind(tx.scheduled_for)
        .bind(tx.executed_at)
        .bind(tx.retry_count)
        .bind(tx.next_retry_at)
        .bind(tx.failure_reason.map(|r| r.as_str()))
        .bind(&tx.settlement_response)
        .bind(&tx.idempotency_key)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if sql_state(&e).as_deref() == Some(UNIQUE_VIOLATION) {
                StoreError::Conflict(format!("transaction {} already exists", tx.id))
            } else {
                StoreError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn update_transaction(&mut self, tx: &Transaction) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions SET
                status = $2,
                executed_at = $3,
                retry_count = $4,
                next_retry_at = $5,
                failure_reason = $6,
                settlement_response = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(tx.id)
        .bind(tx.status.as_str())
        .bind(tx.executed_at)
        .bind(tx.retry_count)
        .bind(tx.next_retry_at)
        .bind(tx.failure_reason.map(|r| r.as_str()))
        .bind(&tx.settlement_response)
        .bind(tx.updated_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("transaction {} does not exist", tx.id)));
        }
        Ok(())
    }

    async fn find_idempotent(&mut self, scope: &IdempotencyScope) -> StoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions WHERE id = (
                SELECT transaction_id FROM idempotency_keys
                WHERE idempotency_key = $1 AND wallet_id = $2 AND operation = $3
            )
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(&scope.key)
        .bind(scope.wallet_id)
        .bind(scope.operation.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (idempotency_key, wallet_id, operation, transaction_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.scope.key)
        .bind(record.scope.wallet_id)
        .bind(record.scope.operation.as_str())
        .bind(record.transaction_id)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if sql_state(&e).as_deref() == Some(UNIQUE_VIOLATION) {
                StoreError::Conflict(format!(
                    "idempotency key {} already used for {} on wallet {}",
                    record.scope.key, record.scope.operation, record.scope.wallet_id
                ))
            } else {
                StoreError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let unit = *self;
        unit.tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WalletRow {
    id: Uuid,
    balance: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Wallet {
            id: row.id,
            balance: row.balance,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Internal row type for SQLx. Enum columns are stored as text.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    wallet_id: Uuid,
    amount: i64,
    transaction_type: String,
    status: String,
    scheduled_for: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    settlement_response: Option<serde_json::Value>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> StoreResult<Transaction> {
        let failure_reason = self
            .failure_reason
            .as_deref()
            .map(str::parse::<FailureReason>)
            .transpose()
            .map_err(StoreError::Corrupt)?;

        Ok(Transaction {
            id: self.id,
            wallet_id: self.wallet_id,
            amount: self.amount,
            transaction_type: self.transaction_type.parse().map_err(StoreError::Corrupt)?,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            scheduled_for: self.scheduled_for,
            executed_at: self.executed_at,
            retry_count: self.retry_count,
            next_retry_at: self.next_retry_at,
            failure_reason,
            settlement_response: self.settlement_response,
            idempotency_key: self.idempotency_key,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
