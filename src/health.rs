use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::ports::LedgerStore;
use crate::settlement::SettlementClient;

/// The service cannot work without these.
const CRITICAL_DEPENDENCIES: [&str; 1] = ["ledger"];

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: HashMap<String, DependencyStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyStatus {
    Healthy { status: String, latency_ms: u64 },
    Unhealthy { status: String, error: String },
}

#[async_trait]
pub trait DependencyChecker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> DependencyStatus;
}

pub struct LedgerChecker {
    store: Arc<dyn LedgerStore>,
}

impl LedgerChecker {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DependencyChecker for LedgerChecker {
    fn name(&self) -> &'static str {
        "ledger"
    }

    async fn check(&self) -> DependencyStatus {
        let start = Instant::now();
        match self.store.ping().await {
            Ok(()) => DependencyStatus::Healthy {
                status: "healthy".to_string(),
                latency_ms: start.elapsed().as_millis() as u64,
            },
            Err(e) => DependencyStatus::Unhealthy {
                status: "unhealthy".to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// Reports the settlement circuit breaker without calling the bank.
pub struct SettlementChecker {
    client: Arc<dyn SettlementClient>,
}

impl SettlementChecker {
    pub fn new(client: Arc<dyn SettlementClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DependencyChecker for SettlementChecker {
    fn name(&self) -> &'static str {
        "settlement"
    }

    async fn check(&self) -> DependencyStatus {
        match self.client.circuit_state().as_str() {
            "closed" => DependencyStatus::Healthy {
                status: "healthy".to_string(),
                latency_ms: 0,
            },
            state => DependencyStatus::Unhealthy {
                status: "unhealthy".to_string(),
                error: format!("circuit breaker {}", state),
            },
        }
    }
}

pub async fn check_health(checkers: &[Box<dyn DependencyChecker>], start_time: Instant) -> HealthResponse {
    let timeout_duration = Duration::from_secs(5);

    let results = futures::future::join_all(
        checkers
            .iter()
            .map(|checker| timeout(timeout_duration, checker.check())),
    )
    .await;

    let dependencies: HashMap<String, DependencyStatus> = checkers
        .iter()
        .zip(results)
        .map(|(checker, result)| {
            let status = result.unwrap_or_else(|_| DependencyStatus::Unhealthy {
                status: "unhealthy".to_string(),
                error: "timeout".to_string(),
            });
            (checker.name().to_string(), status)
        })
        .collect();

    HealthResponse {
        status: determine_overall_status(&dependencies),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: start_time.elapsed().as_secs(),
        dependencies,
    }
}

fn determine_overall_status(dependencies: &HashMap<String, DependencyStatus>) -> String {
    let mut has_critical_failure = false;
    let mut has_non_critical_failure = false;

    for (name, status) in dependencies {
        if matches!(status, DependencyStatus::Unhealthy { .. }) {
            if CRITICAL_DEPENDENCIES.contains(&name.as_str()) {
                has_critical_failure = true;
            } else {
                has_non_critical_failure = true;
            }
        }
    }

    if has_critical_failure {
        "unhealthy".to_string()
    } else if has_non_critical_failure {
        "degraded".to_string()
    } else {
        "healthy".to_string()
    }
}
