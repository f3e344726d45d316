//! Wires the ledger store, settlement client and background services from
//! [`Config`]. Shared by `serve` and the CLI.

use std::sync::Arc;

use crate::adapters::PostgresLedgerStore;
use crate::config::Config;
use crate::db;
use crate::ports::LedgerStore;
use crate::services::{Clock, SystemClock, WithdrawalExecutor, WithdrawalScheduler};
use crate::settlement::{BankClient, SettlementClient};
use crate::AppState;

pub struct Components {
    pub store: Arc<dyn LedgerStore>,
    pub settlement: Arc<dyn SettlementClient>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<WithdrawalScheduler>,
}

impl Components {
    pub fn app_state(&self) -> AppState {
        AppState::new(self.store.clone(), self.settlement.clone(), self.clock.clone())
    }
}

pub async fn build(config: &Config) -> anyhow::Result<Components> {
    let pool = db::create_pool(config).await?;
    let store: Arc<dyn LedgerStore> =
        Arc::new(PostgresLedgerStore::new(pool, config.wallet_lock_timeout()));

    let settlement: Arc<dyn SettlementClient> = Arc::new(BankClient::with_circuit_breaker(
        config.settlement_url.clone(),
        config.settlement_timeout(),
        config.settlement_breaker_failures,
        config.settlement_breaker_reset_secs,
    ));
    tracing::info!("Settlement client initialized with URL: {}", config.settlement_url);

    Ok(assemble(store, settlement, Arc::new(SystemClock), config))
}

/// Builds the executor and scheduler over already constructed adapters.
pub fn assemble(
    store: Arc<dyn LedgerStore>,
    settlement: Arc<dyn SettlementClient>,
    clock: Arc<dyn Clock>,
    config: &Config,
) -> Components {
    let executor = Arc::new(WithdrawalExecutor::new(
        store.clone(),
        settlement.clone(),
        clock.clone(),
        config.retry_policy(),
        config.settlement_timeout(),
    ));
    let scheduler = Arc::new(WithdrawalScheduler::new(
        store.clone(),
        executor,
        clock.clone(),
        config.scheduler(),
    ));

    Components {
        store,
        settlement,
        clock,
        scheduler,
    }
}
