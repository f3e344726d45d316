pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod ports;
pub mod services;
pub mod settlement;
pub mod startup;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Instant;

use crate::health::{DependencyChecker, LedgerChecker, SettlementChecker};
use crate::ports::LedgerStore;
use crate::services::{Clock, WalletService};
use crate::settlement::SettlementClient;

#[derive(Clone)]
pub struct AppState {
    pub wallets: WalletService,
    pub clock: Arc<dyn Clock>,
    pub health_checks: Arc<Vec<Box<dyn DependencyChecker>>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settlement: Arc<dyn SettlementClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let health_checks: Vec<Box<dyn DependencyChecker>> = vec![
            Box::new(LedgerChecker::new(store.clone())),
            Box::new(SettlementChecker::new(settlement)),
        ];
        Self {
            wallets: WalletService::new(store, clock.clone()),
            clock,
            health_checks: Arc::new(health_checks),
            started_at: Instant::now(),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/wallets", post(handlers::wallets::create_wallet))
        .route("/wallets/:id", get(handlers::wallets::get_wallet))
        .route("/wallets/:id/deposit", post(handlers::wallets::deposit))
        .route("/wallets/:id/withdraw", post(handlers::wallets::schedule_withdrawal))
        .route("/wallets/:id/transactions", get(handlers::transactions::list_transactions))
        .route(
            "/wallets/:id/transactions/:tx_id",
            get(handlers::transactions::get_transaction),
        )
        .layer(axum::middleware::from_fn(middleware::request_logger_middleware))
        .with_state(state)
}
