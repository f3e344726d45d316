use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Transaction, Wallet};
use crate::error::AppError;
use crate::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub amount: i64,
    pub scheduled_for: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DepositResponse {
    pub wallet: Wallet,
    pub transaction: Transaction,
    pub duplicate: bool,
}

fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| AppError::Validation("Idempotency-Key must be ASCII".to_string()))?
        .trim();
    if key.is_empty() {
        return Ok(None);
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(AppError::Validation(format!(
            "Idempotency-Key must be at most {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(Some(key.to_string()))
}

fn validate_amount(amount: i64) -> Result<(), AppError> {
    if amount < 1 {
        return Err(AppError::Validation("amount must be at least 1".to_string()));
    }
    Ok(())
}

pub async fn create_wallet(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let wallet = state.wallets.create_wallet().await?;
    Ok((StatusCode::CREATED, Json(wallet)))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let wallet = state.wallets.get_wallet(wallet_id).await?;
    Ok(Json(wallet))
}

pub async fn deposit(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<DepositRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_amount(req.amount)?;
    let key = idempotency_key(&headers)?;

    let (transaction, duplicate) = state.wallets.deposit(wallet_id, req.amount, key).await?;
    let wallet = state.wallets.get_wallet(wallet_id).await?;

    Ok(Json(DepositResponse {
        wallet,
        transaction,
        duplicate,
    }))
}

pub async fn schedule_withdrawal(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<WithdrawRequest>,
) -> Result<impl IntoResponse, AppError> {
    validate_amount(req.amount)?;
    if req.scheduled_for <= state.clock.now() {
        return Err(AppError::Validation(
            "scheduled_for must be in the future".to_string(),
        ));
    }
    let key = idempotency_key(&headers)?;

    let (transaction, duplicate) = state
        .wallets
        .schedule_withdrawal(wallet_id, req.amount, req.scheduled_for, key)
        .await?;

    let status = if duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(transaction)))
}
