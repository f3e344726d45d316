//! Idempotency records: caller-supplied keys mapped to the transaction they produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Operation a key is scoped to. The same key may be reused across operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Deposit,
    ScheduleWithdrawal,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Deposit => "DEPOSIT",
            OperationType::ScheduleWithdrawal => "SCHEDULE_WITHDRAWAL",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(OperationType::Deposit),
            "SCHEDULE_WITHDRAWAL" => Ok(OperationType::ScheduleWithdrawal),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

/// Lookup key of an idempotency record: (key, wallet, operation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyScope {
    pub key: String,
    pub wallet_id: Uuid,
    pub operation: OperationType,
}

impl IdempotencyScope {
    pub fn new(key: impl Into<String>, wallet_id: Uuid, operation: OperationType) -> Self {
        Self {
            key: key.into(),
            wallet_id,
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub scope: IdempotencyScope,
    pub transaction_id: Uuid,
    pub created_at: DateTime<Utc>,
}
