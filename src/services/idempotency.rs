//! Idempotency Guard.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::info;

use crate::domain::{IdempotencyRecord, IdempotencyScope, Transaction};
use crate::ports::LedgerUnit;
use crate::services::error::WalletError;

pub struct IdempotencyGuard;

impl IdempotencyGuard {
    /// Returns the transaction already recorded for `scope`, or runs `producer`
    /// and records its result in the same unit of work.
    ///
    /// The caller must hold the lock of `scope.wallet_id` so two requests with
    /// the same key cannot both miss the lookup. Without a scope every call
    /// runs the producer. The boolean is `true` for a replay. `now` stamps the
    /// new record.
    pub async fn check_or_create<F>(
        unit: &mut dyn LedgerUnit,
        scope: Option<IdempotencyScope>,
        now: DateTime<Utc>,
        producer: F,
    ) -> Result<(Transaction, bool), WalletError>
    where
        F: for<'u> FnOnce(&'u mut dyn LedgerUnit) -> BoxFuture<'u, Result<Transaction, WalletError>>
            + Send,
    {
        let Some(scope) = scope else {
            return Ok((producer(unit).await?, false));
        };

        if let Some(existing) = unit.find_idempotent(&scope).await? {
            info!(
                wallet_id = %scope.wallet_id,
                transaction_id = %existing.id,
                operation = %scope.operation,
                "Duplicate request, returning recorded transaction"
            );
            return Ok((existing, true));
        }

        let tx = producer(&mut *unit).await?;
        unit.insert_idempotency(&IdempotencyRecord {
            scope,
            transaction_id: tx.id,
            created_at: now,
        })
        .await?;
        Ok((tx, false))
    }
}
