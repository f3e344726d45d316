//! Transaction domain entity.
//! Append-only ledger record of a deposit or withdrawal, with the withdrawal
//! status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEPOSIT" => Ok(TransactionType::Deposit),
            "WITHDRAWAL" => Ok(TransactionType::Withdrawal),
            other => Err(format!("unknown transaction type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Processing => "PROCESSING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
        }
    }

    /// Edges of the withdrawal state machine. `COMPLETED` has no outgoing edge.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Failed, Processing)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TransactionStatus::Pending),
            "PROCESSING" => Ok(TransactionStatus::Processing),
            "COMPLETED" => Ok(TransactionStatus::Completed),
            "FAILED" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// Why a withdrawal ended up `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    InsufficientBalance,
    Rejected,
    TransientFailure,
    RetriesExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::InsufficientBalance => "INSUFFICIENT_BALANCE",
            FailureReason::Rejected => "REJECTED",
            FailureReason::TransientFailure => "TRANSIENT_FAILURE",
            FailureReason::RetriesExhausted => "RETRIES_EXHAUSTED",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSUFFICIENT_BALANCE" => Ok(FailureReason::InsufficientBalance),
            "REJECTED" => Ok(FailureReason::Rejected),
            "TRANSIENT_FAILURE" => Ok(FailureReason::TransientFailure),
            "RETRIES_EXHAUSTED" => Ok(FailureReason::RetriesExhausted),
            other => Err(format!("unknown failure reason: {}", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition for transaction {id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub id: Uuid,
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

/// Domain entity representing a ledger transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    /// Set only while a failed withdrawal is waiting for another attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub settlement_response: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// A deposit is recorded already `COMPLETED`; it has no intermediate state.
    pub fn new_deposit(
        wallet_id: Uuid,
        amount: i64,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            amount,
            transaction_type: TransactionType::Deposit,
            status: TransactionStatus::Completed,
            scheduled_for: None,
            executed_at: Some(now),
            retry_count: 0,
            next_retry_at: None,
            failure_reason: None,
            settlement_response: None,
            idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_withdrawal(
        wallet_id: Uuid,
        amount: i64,
        scheduled_for: DateTime<Utc>,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            amount,
            transaction_type: TransactionType::Withdrawal,
            status: TransactionStatus::Pending,
            scheduled_for: Some(scheduled_for),
            executed_at: None,
            retry_count: 0,
            next_retry_at: None,
            failure_reason: None,
            settlement_response: None,
            idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_withdrawal(&self) -> bool {
        self.transaction_type == TransactionType::Withdrawal
    }

    /// A pending withdrawal whose scheduled time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_withdrawal()
            && self.status == TransactionStatus::Pending
            && self.scheduled_for.map_or(false, |at| at <= now)
    }

    /// A failed withdrawal that still has attempts left and whose backoff has elapsed.
    pub fn is_retry_eligible(&self, max_retries: i32, now: DateTime<Utc>) -> bool {
        self.is_withdrawal()
            && self.status == TransactionStatus::Failed
            && self.retry_count < max_retries
            && self.next_retry_at.map_or(false, |at| at <= now)
    }

    pub fn is_executable(&self, max_retries: i32, now: DateTime<Utc>) -> bool {
        self.is_due(now) || self.is_retry_eligible(max_retries, now)
    }

    /// `COMPLETED`, or `FAILED` with no further attempt planned.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TransactionStatus::Completed => true,
            TransactionStatus::Failed => self.next_retry_at.is_none(),
            _ => false,
        }
    }

    fn transition(
        &mut self,
        next: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let allowed = self.status.can_transition_to(next)
            && !(self.status == TransactionStatus::Failed && self.next_retry_at.is_none());
        if !allowed {
            return Err(InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TransactionStatus::Processing, now)?;
        self.next_retry_at = None;
        Ok(())
    }

    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        response: serde_json::Value,
    ) -> Result<(), InvalidTransition> {
        self.transition(TransactionStatus::Completed, now)?;
        self.executed_at = Some(now);
        self.failure_reason = None;
        self.settlement_response = Some(response);
        Ok(())
    }

    /// Moves to `FAILED`. `next_retry_at` of `None` makes the failure terminal.
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        reason: FailureReason,
        next_retry_at: Option<DateTime<Utc>>,
        response: serde_json::Value,
    ) -> Result<(), InvalidTransition> {
        self.transition(TransactionStatus::Failed, now)?;
        self.executed_at = Some(now);
        self.failure_reason = Some(reason);
        self.next_retry_at = next_retry_at;
        self.settlement_response = Some(response);
        Ok(())
    }
}

/// Optional filters for listing a wallet's transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.status.map_or(true, |s| s == tx.status)
            && self.transaction_type.map_or(true, |t| t == tx.transaction_type)
    }
}
