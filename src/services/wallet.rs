//! Inbound operations and queries. Handlers and the CLI only talk to this.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::domain::{
    IdempotencyScope, OperationType, Transaction, TransactionFilter, Wallet,
};
use crate::ports::LedgerStore;
use crate::services::balance::BalanceService;
use crate::services::clock::Clock;
use crate::services::error::WalletError;
use crate::services::idempotency::IdempotencyGuard;

#[derive(Clone)]
pub struct WalletService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    balance: BalanceService,
}

impl WalletService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let balance = BalanceService::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            balance,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn create_wallet(&self) -> Result<Wallet, WalletError> {
        let wallet = self.store.insert_wallet(&Wallet::new(self.clock.now())).await?;
        info!(wallet_id = %wallet.id, "Wallet created");
        Ok(wallet)
    }

    pub async fn get_wallet(&self, wallet_id: Uuid) -> Result<Wallet, WalletError> {
        self.store
            .get_wallet(wallet_id)
            .await?
            .ok_or(WalletError::WalletNotFound(wallet_id))
    }

    pub async fn deposit(
        &self,
        wallet_id: Uuid,
        amount: i64,
        idempotency_key: Option<String>,
    ) -> Result<(Transaction, bool), WalletError> {
        self.balance.deposit(wallet_id, amount, idempotency_key).await
    }

    /// Records a `PENDING` withdrawal. Funds are checked at execution time,
    /// not here; a past `scheduled_for` is simply due on the next poll.
    pub async fn schedule_withdrawal(
        &self,
        wallet_id: Uuid,
        amount: i64,
        scheduled_for: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> Result<(Transaction, bool), WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }

        let now = self.clock.now();
        let mut unit = self.store.begin().await?;
        // The lock serializes requests sharing an idempotency key.
        unit.lock_wallet(wallet_id).await?;

        let scope = idempotency_key
            .as_ref()
            .map(|key| IdempotencyScope::new(key.clone(), wallet_id, OperationType::ScheduleWithdrawal));

        let (tx, duplicate) = IdempotencyGuard::check_or_create(unit.as_mut(), scope, now, move |unit| {
            Box::pin(async move {
                let tx = Transaction::new_withdrawal(wallet_id, amount, scheduled_for, idempotency_key, now);
                unit.insert_transaction(&tx).await?;
                info!(
                    wallet_id = %wallet_id,
                    transaction_id = %tx.id,
                    amount,
                    scheduled_for = %scheduled_for,
                    "Withdrawal scheduled"
                );
                Ok::<_, WalletError>(tx)
            })
        })
        .await?;

        unit.commit().await?;
        Ok((tx, duplicate))
    }

    pub async fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction, WalletError> {
        self.store
            .get_transaction(transaction_id)
            .await?
            .ok_or(WalletError::TransactionNotFound(transaction_id))
    }

    /// A transaction that belongs to another wallet is reported as not found.
    pub async fn get_wallet_transaction(
        &self,
        wallet_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Transaction, WalletError> {
        self.get_wallet(wallet_id).await?;
        let tx = self.get_transaction(transaction_id).await?;
        if tx.wallet_id != wallet_id {
            return Err(WalletError::TransactionNotFound(transaction_id));
        }
        Ok(tx)
    }

    pub async fn list_transactions(
        &self,
        wallet_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, WalletError> {
        self.get_wallet(wallet_id).await?;
        Ok(self.store.list_transactions(wallet_id, filter).await?)
    }
}
