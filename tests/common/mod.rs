#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use wallet_core::adapters::InMemoryLedgerStore;
use wallet_core::ports::LedgerStore;
use wallet_core::services::{
    Clock, ManualClock, RetryPolicy, SchedulerConfig, WalletService, WithdrawalExecutor,
    WithdrawalScheduler,
};
use wallet_core::settlement::{SettlementClient, SettlementOutcome};

/// Settlement double that replays a script, then keeps returning `fallback`.
pub struct ScriptedSettlement {
    script: Mutex<VecDeque<SettlementOutcome>>,
    fallback: SettlementOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedSettlement {
    pub fn always(outcome: SettlementOutcome) -> Self {
        Self::scripted(Vec::new(), outcome)
    }

    pub fn scripted(outcomes: Vec<SettlementOutcome>, fallback: SettlementOutcome) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettlementClient for ScriptedSettlement {
    async fn settle(&self, _transaction_id: Uuid, _amount: i64) -> SettlementOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryLedgerStore>,
    pub clock: ManualClock,
    pub settlement: Arc<ScriptedSettlement>,
    pub wallets: WalletService,
    pub executor: Arc<WithdrawalExecutor>,
    pub scheduler: WithdrawalScheduler,
    pub retry_policy: RetryPolicy,
}

impl Harness {
    pub fn new(settlement: ScriptedSettlement) -> Self {
        Self::with_settlement_timeout(settlement, Duration::from_secs(5))
    }

    pub fn with_settlement_timeout(settlement: ScriptedSettlement, timeout: Duration) -> Self {
        Self::build(
            settlement,
            timeout,
            Duration::from_secs(5),
            SchedulerConfig::default(),
        )
    }

    /// Short wallet lock waits, so contention tests fail fast.
    pub fn with_lock_timeout(settlement: ScriptedSettlement, lock_timeout: Duration) -> Self {
        Self::build(
            settlement,
            Duration::from_secs(5),
            lock_timeout,
            SchedulerConfig::default(),
        )
    }

    pub fn with_scheduler_config(settlement: ScriptedSettlement, config: SchedulerConfig) -> Self {
        Self::build(settlement, Duration::from_secs(5), Duration::from_secs(5), config)
    }

    fn build(
        settlement: ScriptedSettlement,
        timeout: Duration,
        lock_timeout: Duration,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        let store = Arc::new(InMemoryLedgerStore::with_lock_timeout(lock_timeout));
        let clock = ManualClock::new(Utc::now());
        let settlement = Arc::new(settlement);
        let retry_policy = RetryPolicy::default();

        let wallets = WalletService::new(store.clone(), Arc::new(clock.clone()));
        let executor = Arc::new(WithdrawalExecutor::new(
            store.clone(),
            settlement.clone(),
            Arc::new(clock.clone()),
            retry_policy.clone(),
            timeout,
        ));
        let scheduler = WithdrawalScheduler::new(
            store.clone(),
            executor.clone(),
            Arc::new(clock.clone()),
            scheduler_config,
        );

        Self {
            store,
            clock,
            settlement,
            wallets,
            executor,
            scheduler,
            retry_policy,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn funded_wallet(&self, balance: i64) -> Uuid {
        let wallet = self.wallets.create_wallet().await.unwrap();
        if balance > 0 {
            self.wallets.deposit(wallet.id, balance, None).await.unwrap();
        }
        wallet.id
    }

    pub async fn balance(&self, wallet_id: Uuid) -> i64 {
        self.store.get_wallet(wallet_id).await.unwrap().unwrap().balance
    }

    /// One scheduler pass, waiting for every dispatched worker. Returns the
    /// number of dispatched withdrawals.
    pub async fn run_tick(&self) -> usize {
        let handles = self.scheduler.tick().await.unwrap();
        let dispatched = handles.len();
        for handle in handles {
            handle.await.unwrap();
        }
        dispatched
    }
}
