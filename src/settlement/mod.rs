//! Outbound settlement dependency.

pub mod client;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub use client::{BankClient, SettlementError};

/// Result of one settlement attempt. Each variant carries the detail kept on
/// the transaction for auditing.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Success(Value),
    /// Definitive business refusal. Not retried.
    Rejected(Value),
    /// Connection error, timeout, 5xx or an open breaker. Retryable.
    TransientFailure(Value),
}

impl SettlementOutcome {
    pub fn detail(&self) -> &Value {
        match self {
            SettlementOutcome::Success(v)
            | SettlementOutcome::Rejected(v)
            | SettlementOutcome::TransientFailure(v) => v,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SettlementOutcome::Success(_) => "success",
            SettlementOutcome::Rejected(_) => "rejected",
            SettlementOutcome::TransientFailure(_) => "transient_failure",
        }
    }
}

#[async_trait]
pub trait SettlementClient: Send + Sync {
    async fn settle(&self, transaction_id: Uuid, amount: i64) -> SettlementOutcome;

    /// "closed" while calls are permitted, "open" otherwise.
    fn circuit_state(&self) -> String {
        "closed".to_string()
    }
}
