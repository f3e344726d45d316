use thiserror::Error;
use uuid::Uuid;

use crate::domain::transaction::InvalidTransition;
use crate::ports::StoreError;

/// Failures surfaced by the wallet services.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Amount must be a positive integer, got {0}")]
    InvalidAmount(i64),

    #[error("Wallet not found: {0}")]
    WalletNotFound(Uuid),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("Insufficient balance on wallet {wallet_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        wallet_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Store(StoreError),
}

impl WalletError {
    /// Whether the operation may succeed if simply tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::Store(e) if e.is_transient())
    }
}

impl From<StoreError> for WalletError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WalletNotFound(id) => WalletError::WalletNotFound(id),
            other => WalletError::Store(other),
        }
    }
}
