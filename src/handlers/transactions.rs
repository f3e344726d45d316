use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{TransactionFilter, TransactionStatus, TransactionType};
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TransactionQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: Option<String>,
}

impl TransactionQuery {
    fn into_filter(self) -> Result<TransactionFilter, AppError> {
        let status = self
            .status
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<TransactionStatus>())
            .transpose()
            .map_err(AppError::Validation)?;
        let transaction_type = self
            .transaction_type
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<TransactionType>())
            .transpose()
            .map_err(AppError::Validation)?;
        Ok(TransactionFilter {
            status,
            transaction_type,
        })
    }
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    Query(query): Query<TransactionQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = query.into_filter()?;
    let transactions = state.wallets.list_transactions(wallet_id, &filter).await?;
    Ok(Json(transactions))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path((wallet_id, transaction_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, AppError> {
    let transaction = state
        .wallets
        .get_wallet_transaction(wallet_id, transaction_id)
        .await?;
    Ok(Json(transaction))
}
