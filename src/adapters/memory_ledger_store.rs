//! In-memory implementation of the ledger ports.
//!
//! Each wallet has its own async mutex standing in for the row lock. A unit of
//! work stages its writes locally and applies them to the shared state on
//! commit, so an abandoned unit leaves no trace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::domain::{
    IdempotencyRecord, IdempotencyScope, Transaction, TransactionFilter, TransactionStatus, Wallet,
};
use crate::ports::{LedgerStore, LedgerUnit, StoreError, StoreResult};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MemoryState {
    wallets: HashMap<Uuid, Wallet>,
    transactions: HashMap<Uuid, Transaction>,
    idempotency: HashMap<IdempotencyScope, Uuid>,
}

type WalletLocks = Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>;

fn lock_state(state: &Mutex<MemoryState>) -> StoreResult<MutexGuard<'_, MemoryState>> {
    state.lock().map_err(|_| StoreError::Poisoned)
}

#[derive(Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
    locks: WalletLocks,
    lock_timeout: Duration,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout,
        }
    }

    fn select<F>(&self, limit: i64, mut keep: F) -> StoreResult<Vec<Transaction>>
    where
        F: FnMut(&Transaction) -> bool,
    {
        let state = lock_state(&self.state)?;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| keep(tx))
            .cloned()
            .collect();
        drop(state);
        rows.sort_by_key(|tx| (tx.scheduled_for, tx.created_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerUnit>> {
        Ok(Box::new(MemoryUnit {
            state: self.state.clone(),
            locks: self.locks.clone(),
            lock_timeout: self.lock_timeout,
            guards: HashMap::new(),
            wallets: HashMap::new(),
            transactions: HashMap::new(),
            idempotency: Vec::new(),
        }))
    }

    async fn ping(&self) -> StoreResult<()> {
        lock_state(&self.state).map(|_| ())
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> StoreResult<Wallet> {
        let mut state = lock_state(&self.state)?;
        if state.wallets.contains_key(&wallet.id) {
            return Err(StoreError::Conflict(format!("wallet {} already exists", wallet.id)));
        }
        state.wallets.insert(wallet.id, wallet.clone());
        Ok(wallet.clone())
    }

    async fn get_wallet(&self, id: Uuid) -> StoreResult<Option<Wallet>> {
        let state = lock_state(&self.state)?;
        Ok(state.wallets.get(&id).cloned())
    }

    async fn get_transaction(&self, id: Uuid) -> StoreResult<Option<Transaction>> {
        let state = lock_state(&self.state)?;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
        filter: &TransactionFilter,
    ) -> StoreResult<Vec<Transaction>> {
        let state = lock_state(&self.state)?;
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.wallet_id == wallet_id && filter.matches(tx))
            .cloned()
            .collect();
        drop(state);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn due_withdrawals(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Transaction>> {
        self.select(limit, |tx| tx.is_due(now))
    }

    async fn retryable_withdrawals(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>> {
        self.select(limit, |tx| tx.is_retry_eligible(max_retries, now))
    }

    async fn stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Transaction>> {
        self.select(limit, |tx| {
            tx.is_withdrawal()
                && tx.status == TransactionStatus::Processing
                && tx.updated_at < older_than
        })
    }
}

struct MemoryUnit {
    state: Arc<Mutex<MemoryState>>,
    locks: WalletLocks,
    lock_timeout: Duration,
    guards: HashMap<Uuid, OwnedMutexGuard<()>>,
    wallets: HashMap<Uuid, Wallet>,
    transactions: HashMap<Uuid, Transaction>,
    idempotency: Vec<IdempotencyRecord>,
}

impl MemoryUnit {
    fn wallet_mutex(&self, wallet_id: Uuid) -> StoreResult<Arc<AsyncMutex<()>>> {
        let mut locks = self.locks.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(locks
            .entry(wallet_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    async fn locked_wallet(&mut self, wallet_id: Uuid) -> StoreResult<&mut Wallet> {
        if !self.wallets.contains_key(&wallet_id) {
            self.lock_wallet(wallet_id).await?;
        }
        self.wallets
            .get_mut(&wallet_id)
            .ok_or(StoreError::WalletNotFound(wallet_id))
    }

    fn known_transaction(&self, id: Uuid) -> StoreResult<bool> {
        if self.transactions.contains_key(&id) {
            return Ok(true);
        }
        let state = lock_state(&self.state)?;
        Ok(state.transactions.contains_key(&id))
    }
}

#[async_trait]
impl LedgerUnit for MemoryUnit {
    async fn lock_wallet(&mut self, wallet_id: Uuid) -> StoreResult<Wallet> {
        if let Some(wallet) = self.wallets.get(&wallet_id) {
            return Ok(wallet.clone());
        }

        let exists = {
            let state = lock_state(&self.state)?;
            state.wallets.contains_key(&wallet_id)
        };
        if !exists {
            return Err(StoreError::WalletNotFound(wallet_id));
        }

        let mutex = self.wallet_mutex(wallet_id)?;
        let guard = tokio::time::timeout(self.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(wallet_id))?;

        // Re-read after the lock is held; the previous holder may have committed.
        let wallet = {
            let state = lock_state(&self.state)?;
            state.wallets.get(&wallet_id).cloned()
        }
        .ok_or(StoreError::WalletNotFound(wallet_id))?;

        self.guards.insert(wallet_id, guard);
        self.wallets.insert(wallet_id, wallet.clone());
        Ok(wallet)
    }

    async fn credit(&mut self, wallet_id: Uuid, amount: i64) -> StoreResult<i64> {
        let wallet = self.locked_wallet(wallet_id).await?;
        wallet.balance = wallet
            .balance
            .checked_add(amount)
            .ok_or_else(|| StoreError::Conflict(format!("balance overflow on wallet {}", wallet_id)))?;
        wallet.updated_at = Utc::now();
        Ok(wallet.balance)
    }

    async fn debit_if_sufficient(&mut self, wallet_id: Uuid, amount: i64) -> StoreResult<Option<i64>> {
        let wallet = self.locked_wallet(wallet_id).await?;
        if wallet.balance < amount {
            return Ok(None);
        }
        wallet.balance -= amount;
        wallet.updated_at = Utc::now();
        Ok(Some(wallet.balance))
    }

    async fn get_transaction(&mut self, id: Uuid) -> StoreResult<Option<Transaction>> {
        if let Some(tx) = self.transactions.get(&id) {
            return Ok(Some(tx.clone()));
        }
        let state = lock_state(&self.state)?;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn insert_transaction(&mut self, tx: &Transaction) -> StoreResult<()> {
        if self.known_transaction(tx.id)? {
            return Err(StoreError::Conflict(format!("transaction {} already exists", tx.id)));
        }
        self.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update_transaction(&mut self, tx: &Transaction) -> StoreResult<()> {
        if !self.known_transaction(tx.id)? {
            return Err(StoreError::Conflict(format!("transaction {} does not exist", tx.id)));
        }
        self.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn find_idempotent(&mut self, scope: &IdempotencyScope) -> StoreResult<Option<Transaction>> {
        let staged = self
            .idempotency
            .iter()
            .find(|record| &record.scope == scope)
            .map(|record| record.transaction_id);
        let transaction_id = match staged {
            Some(id) => Some(id),
            None => {
                let state = lock_state(&self.state)?;
                state.idempotency.get(scope).copied()
            }
        };

        match transaction_id {
            Some(id) => self.get_transaction(id).await,
            None => Ok(None),
        }
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> StoreResult<()> {
        if self.find_idempotent(&record.scope).await?.is_some() {
            return Err(StoreError::Conflict(format!(
                "idempotency key {} already used for {} on wallet {}",
                record.scope.key, record.scope.operation, record.scope.wallet_id
            )));
        }
        self.idempotency.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let unit = *self;
        {
            let mut state = lock_state(&unit.state)?;
            if let Some(record) = unit
                .idempotency
                .iter()
                .find(|record| state.idempotency.contains_key(&record.scope))
            {
                return Err(StoreError::Conflict(format!(
                    "idempotency key {} already used",
                    record.scope.key
                )));
            }
            for (id, wallet) in unit.wallets {
                state.wallets.insert(id, wallet);
            }
            for (id, tx) in unit.transactions {
                state.transactions.insert(id, tx);
            }
            for record in unit.idempotency {
                state.idempotency.insert(record.scope, record.transaction_id);
            }
        }
        drop(unit.guards);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IdempotencyScope, OperationType};

    async fn store_with_wallet(balance: i64) -> (InMemoryLedgerStore, Uuid) {
        let store = InMemoryLedgerStore::new();
        let mut wallet = Wallet::new(Utc::now());
        wallet.balance = balance;
        store.insert_wallet(&wallet).await.unwrap();
        (store, wallet.id)
    }

    #[tokio::test]
    async fn test_uncommitted_unit_leaves_no_trace() {
        let (store, wallet_id) = store_with_wallet(100).await;

        let mut unit = store.begin().await.unwrap();
        assert_eq!(unit.credit(wallet_id, 50).await.unwrap(), 150);
        drop(unit);

        let wallet = store.get_wallet(wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 100);
    }

    #[tokio::test]
    async fn test_debit_refuses_to_go_negative() {
        let (store, wallet_id) = store_with_wallet(100).await;

        let mut unit = store.begin().await.unwrap();
        assert_eq!(unit.debit_if_sufficient(wallet_id, 150).await.unwrap(), None);
        assert_eq!(unit.debit_if_sufficient(wallet_id, 100).await.unwrap(), Some(0));
        unit.commit().await.unwrap();

        let wallet = store.get_wallet(wallet_id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 0);
    }

    #[tokio::test]
    async fn test_lock_wait_is_bounded() {
        let store = InMemoryLedgerStore::with_lock_timeout(Duration::from_millis(50));
        let wallet = Wallet::new(Utc::now());
        store.insert_wallet(&wallet).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.lock_wallet(wallet.id).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.lock_wallet(wallet.id).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(id) if id == wallet.id));

        holder.commit().await.unwrap();
        assert!(waiter.lock_wallet(wallet.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_on_missing_wallet() {
        let store = InMemoryLedgerStore::new();
        let mut unit = store.begin().await.unwrap();
        let missing = Uuid::new_v4();
        assert!(matches!(
            unit.lock_wallet(missing).await,
            Err(StoreError::WalletNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_idempotency_record_visible_after_commit() {
        let (store, wallet_id) = store_with_wallet(0).await;
        let now = Utc::now();
        let tx = Transaction::new_deposit(wallet_id, 10, Some("key".to_string()), now);
        let scope = IdempotencyScope::new("key", wallet_id, OperationType::Deposit);

        let mut unit = store.begin().await.unwrap();
        unit.lock_wallet(wallet_id).await.unwrap();
        unit.insert_transaction(&tx).await.unwrap();
        unit.insert_idempotency(&IdempotencyRecord {
            scope: scope.clone(),
            transaction_id: tx.id,
            created_at: now,
        })
        .await
        .unwrap();
        unit.commit().await.unwrap();

        let mut unit = store.begin().await.unwrap();
        let found = unit.find_idempotent(&scope).await.unwrap().unwrap();
        assert_eq!(found.id, tx.id);

        let other_op = IdempotencyScope::new("key", wallet_id, OperationType::ScheduleWithdrawal);
        assert!(unit.find_idempotent(&other_op).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_withdrawals_ordering_and_limit() {
        let (store, wallet_id) = store_with_wallet(0).await;
        let now = Utc::now();
        let later = Transaction::new_withdrawal(wallet_id, 1, now - chrono::Duration::minutes(1), None, now);
        let earlier = Transaction::new_withdrawal(wallet_id, 2, now - chrono::Duration::minutes(5), None, now);
        let future = Transaction::new_withdrawal(wallet_id, 3, now + chrono::Duration::minutes(5), None, now);

        let mut unit = store.begin().await.unwrap();
        for tx in [&later, &earlier, &future] {
            unit.insert_transaction(tx).await.unwrap();
        }
        unit.commit().await.unwrap();

        let due = store.due_withdrawals(now, 10).await.unwrap();
        assert_eq!(due.iter().map(|t| t.id).collect::<Vec<_>>(), vec![earlier.id, later.id]);

        let limited = store.due_withdrawals(now, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
