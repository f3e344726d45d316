pub mod transactions;
pub mod wallets;

use crate::AppState;
use crate::health::check_health;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = check_health(&state.health_checks, state.started_at).await;

    // 503 only when a critical dependency is down
    let status_code = if report.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(report))
}
