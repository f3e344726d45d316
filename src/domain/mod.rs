//! Framework-agnostic domain types for wallets and their ledger.

pub mod idempotency;
pub mod transaction;
pub mod wallet;

pub use idempotency::{IdempotencyRecord, IdempotencyScope, OperationType};
pub use transaction::{
    FailureReason, Transaction, TransactionFilter, TransactionStatus, TransactionType,
};
pub use wallet::Wallet;
