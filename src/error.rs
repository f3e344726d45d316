use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::ports::StoreError;
use crate::services::WalletError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<WalletError> for AppError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InvalidAmount(_) => AppError::Validation(err.to_string()),
            WalletError::WalletNotFound(_) | WalletError::TransactionNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            WalletError::InsufficientBalance { .. } => AppError::Conflict(err.to_string()),
            WalletError::InvalidTransition(_) => AppError::Conflict(err.to_string()),
            WalletError::Store(StoreError::LockTimeout(_)) => AppError::Unavailable(err.to_string()),
            WalletError::Store(StoreError::Conflict(_)) => AppError::Conflict(err.to_string()),
            WalletError::Store(e) => {
                tracing::error!("Store error: {}", e);
                AppError::Internal("storage failure".to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
