//! Withdrawal Scheduler: a fixed-interval poll over the ledger store that hands
//! every due or retry-eligible withdrawal to its own worker task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ports::LedgerStore;
use crate::services::clock::Clock;
use crate::services::error::WalletError;
use crate::services::executor::{ExecutionOutcome, WithdrawalExecutor};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub worker_concurrency: usize,
    /// `PROCESSING` for longer than this is reported as stale.
    pub stale_after: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            worker_concurrency: 16,
            stale_after: Duration::from_secs(300),
        }
    }
}

pub struct WithdrawalScheduler {
    store: Arc<dyn LedgerStore>,
    executor: Arc<WithdrawalExecutor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    /// Ids with a live worker, queued on the semaphore or executing.
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

/// Drops the id from the in-flight set when the worker ends, even on panic.
struct InFlight {
    set: Arc<Mutex<HashSet<Uuid>>>,
    id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.id);
    }
}

impl WithdrawalScheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        executor: Arc<WithdrawalExecutor>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            store,
            executor,
            clock,
            config,
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Polls until `shutdown` flips to `true` or its sender is dropped.
    /// Workers already spawned are left to finish on their own.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            worker_concurrency = self.config.worker_concurrency,
            "Withdrawal scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Withdrawal scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One poll cycle. Returns the handles of the spawned workers; the loop
    /// drops them, callers that need to wait (tests, the CLI) can join them.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>, WalletError> {
        let now = self.clock.now();
        let max_retries = self.executor.retry_policy().max_retries;

        let due = self.store.due_withdrawals(now, self.config.batch_size).await?;
        let retryable = self
            .store
            .retryable_withdrawals(now, max_retries, self.config.batch_size)
            .await?;

        self.report_stale(now).await;

        // Inserting into the in-flight set also dedupes due against retryable.
        let ids: Vec<Uuid> = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            due.iter()
                .chain(retryable.iter())
                .map(|tx| tx.id)
                .filter(|id| in_flight.insert(*id))
                .collect()
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            due = due.len(),
            retryable = retryable.len(),
            dispatched = ids.len(),
            "Dispatching withdrawals"
        );

        Ok(ids.into_iter().map(|id| self.dispatch(id)).collect())
    }

    fn dispatch(&self, transaction_id: Uuid) -> JoinHandle<()> {
        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let in_flight = InFlight {
            set: self.in_flight.clone(),
            id: transaction_id,
        };

        tokio::spawn(async move {
            let _in_flight = in_flight;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match executor.execute(transaction_id).await {
                Ok(ExecutionOutcome::Skipped) => {
                    debug!(transaction_id = %transaction_id, "Dispatch was a no-op");
                }
                Ok(outcome) => {
                    debug!(transaction_id = %transaction_id, outcome = ?outcome, "Withdrawal attempt finished");
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        transaction_id = %transaction_id,
                        error = %e,
                        "Withdrawal attempt deferred to next poll"
                    );
                }
                Err(e) => {
                    error!(transaction_id = %transaction_id, error = %e, "Withdrawal attempt failed");
                }
            }
        })
    }

    async fn report_stale(&self, now: chrono::DateTime<chrono::Utc>) {
        let stale_after = chrono::Duration::milliseconds(self.config.stale_after.as_millis() as i64);
        match self
            .store
            .stale_processing(now - stale_after, self.config.batch_size)
            .await
        {
            Ok(stale) => {
                for tx in stale {
                    warn!(
                        transaction_id = %tx.id,
                        wallet_id = %tx.wallet_id,
                        amount = tx.amount,
                        since = %tx.updated_at,
                        "Withdrawal stuck in PROCESSING, needs reconciliation"
                    );
                }
            }
            Err(e) => error!("Stale withdrawal check failed: {}", e),
        }
    }
}
