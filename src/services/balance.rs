//! Balance Service: every balance mutation goes through here, inside a unit of
//! work that holds the wallet lock.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::{IdempotencyScope, OperationType, Transaction};
use crate::ports::{LedgerStore, LedgerUnit};
use crate::services::clock::Clock;
use crate::services::error::WalletError;
use crate::services::idempotency::IdempotencyGuard;

#[derive(Clone)]
pub struct BalanceService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl BalanceService {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Credits `amount` and records a `COMPLETED` deposit in one unit of work.
    /// Returns the transaction and whether it was an idempotent replay.
    pub async fn deposit(
        &self,
        wallet_id: Uuid,
        amount: i64,
        idempotency_key: Option<String>,
    ) -> Result<(Transaction, bool), WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }

        let now = self.clock.now();
        let mut unit = self.store.begin().await?;
        unit.lock_wallet(wallet_id).await?;

        let scope = idempotency_key
            .as_ref()
            .map(|key| IdempotencyScope::new(key.clone(), wallet_id, OperationType::Deposit));

        let (tx, duplicate) = IdempotencyGuard::check_or_create(unit.as_mut(), scope, now, move |unit| {
            Box::pin(async move {
                let balance = unit.credit(wallet_id, amount).await?;
                let tx = Transaction::new_deposit(wallet_id, amount, idempotency_key, now);
                unit.insert_transaction(&tx).await?;
                info!(
                    wallet_id = %wallet_id,
                    transaction_id = %tx.id,
                    amount,
                    balance,
                    "Deposit applied"
                );
                Ok::<_, WalletError>(tx)
            })
        })
        .await?;

        unit.commit().await?;
        Ok((tx, duplicate))
    }

    /// Debits `amount` if the balance covers it. Must run inside a unit that
    /// will also record the withdrawal's transition to `PROCESSING`.
    pub async fn reserve_for_withdrawal(
        unit: &mut dyn LedgerUnit,
        wallet_id: Uuid,
        amount: i64,
    ) -> Result<i64, WalletError> {
        let wallet = unit.lock_wallet(wallet_id).await?;
        match unit.debit_if_sufficient(wallet_id, amount).await? {
            Some(balance) => Ok(balance),
            None => Err(WalletError::InsufficientBalance {
                wallet_id,
                requested: amount,
                available: wallet.balance,
            }),
        }
    }

    /// Reverses a reservation. Returns the new balance.
    pub async fn refund(
        unit: &mut dyn LedgerUnit,
        wallet_id: Uuid,
        amount: i64,
    ) -> Result<i64, WalletError> {
        unit.lock_wallet(wallet_id).await?;
        let balance = unit.credit(wallet_id, amount).await?;
        info!(wallet_id = %wallet_id, amount, balance, "Reservation refunded");
        Ok(balance)
    }
}
