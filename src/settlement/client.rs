use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use super::{SettlementClient, SettlementOutcome};

/// Failures that count against the circuit breaker. A business refusal is not
/// one of them.
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Settlement service error (status {status})")]
    ServerError { status: u16, body: Value },
    #[error("Circuit breaker open")]
    CircuitBreakerOpen,
}

impl SettlementError {
    fn detail(&self) -> Value {
        match self {
            SettlementError::ServerError { body, .. } => body.clone(),
            other => json!({ "error": other.to_string() }),
        }
    }
}

#[derive(Debug, Serialize)]
struct SettlementRequest {
    transaction_id: Uuid,
    amount: i64,
}

/// HTTP client for the bank's settlement endpoint.
#[derive(Clone)]
pub struct BankClient {
    client: Client,
    endpoint: String,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl BankClient {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self::with_circuit_breaker(endpoint, timeout, 5, 30)
    }

    pub fn with_circuit_breaker(
        endpoint: String,
        timeout: Duration,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        BankClient {
            client,
            endpoint,
            circuit_breaker,
        }
    }

    async fn post(&self, transaction_id: Uuid, amount: i64) -> Result<SettlementOutcome, SettlementError> {
        let client = self.client.clone();
        let url = self.endpoint.clone();
        let request = SettlementRequest {
            transaction_id,
            amount,
        };

        let result = self
            .circuit_breaker
            .call(async move {
                let response = client.post(&url).json(&request).send().await?;
                let status = response.status();
                let text = response.text().await?;
                let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| json!({ "raw": text }));
                classify(status, body)
            })
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(FailsafeError::Rejected) => Err(SettlementError::CircuitBreakerOpen),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

/// Maps an HTTP response onto a settlement outcome.
///
/// 429 and 5xx are infrastructure failures, any other 4xx is a refusal. A 2xx
/// only counts as settled when the body says `"status": 200`. A 5xx-class body
/// status is an infrastructure failure; a missing or non-numeric one is a refusal.
fn classify(status: StatusCode, body: Value) -> Result<SettlementOutcome, SettlementError> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SettlementError::ServerError {
            status: status.as_u16(),
            body,
        });
    }
    if status.is_client_error() {
        return Ok(SettlementOutcome::Rejected(body));
    }
    if !status.is_success() {
        return Err(SettlementError::ServerError {
            status: status.as_u16(),
            body,
        });
    }

    match body.get("status").and_then(Value::as_i64) {
        Some(200) => Ok(SettlementOutcome::Success(body)),
        Some(code) if code >= 500 => Err(SettlementError::ServerError {
            status: code as u16,
            body,
        }),
        Some(_) | None => Ok(SettlementOutcome::Rejected(body)),
    }
}

#[async_trait]
impl SettlementClient for BankClient {
    async fn settle(&self, transaction_id: Uuid, amount: i64) -> SettlementOutcome {
        match self.post(transaction_id, amount).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(transaction_id = %transaction_id, error = %e, "Settlement call failed");
                SettlementOutcome::TransientFailure(e.detail())
            }
        }
    }

    fn circuit_state(&self) -> String {
        if self.circuit_breaker.is_call_permitted() {
            "closed".to_string()
        } else {
            "open".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: String) -> BankClient {
        BankClient::with_circuit_breaker(url, Duration::from_secs(2), 3, 60)
    }

    #[test]
    fn test_classify_status_codes() {
        assert!(matches!(
            classify(StatusCode::OK, json!({"status": 200})),
            Ok(SettlementOutcome::Success(_))
        ));
        assert!(matches!(
            classify(StatusCode::OK, json!({"status": 402})),
            Ok(SettlementOutcome::Rejected(_))
        ));
        assert!(matches!(
            classify(StatusCode::OK, json!({"status": 503})),
            Err(SettlementError::ServerError { status: 503, .. })
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, json!({})),
            Ok(SettlementOutcome::Rejected(_))
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, json!({})),
            Err(SettlementError::ServerError { status: 429, .. })
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, json!({})),
            Err(SettlementError::ServerError { status: 502, .. })
        ));
    }

    #[test]
    fn test_classify_unconfirmed_2xx_is_refusal() {
        assert!(matches!(
            classify(
                StatusCode::OK,
                json!({"status": "declined", "error": "insufficient funds at bank"})
            ),
            Ok(SettlementOutcome::Rejected(_))
        ));
        assert!(matches!(
            classify(StatusCode::OK, json!({"error": "account closed"})),
            Ok(SettlementOutcome::Rejected(_))
        ));
        assert!(matches!(
            classify(StatusCode::OK, json!({"raw": "accepted"})),
            Ok(SettlementOutcome::Rejected(_))
        ));
        assert!(matches!(
            classify(StatusCode::ACCEPTED, json!({"status": "200"})),
            Ok(SettlementOutcome::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_settle_2xx_without_confirmation_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": "declined"}"#)
            .create_async()
            .await;

        let outcome = client(server.url()).settle(Uuid::new_v4(), 100).await;
        assert_eq!(
            outcome,
            SettlementOutcome::Rejected(json!({"status": "declined"}))
        );
    }

    #[test]
    fn test_circuit_starts_closed() {
        let client = client("http://localhost:1".to_string());
        assert_eq!(client.circuit_state(), "closed");
    }

    #[tokio::test]
    async fn test_settle_success() {
        let mut server = mockito::Server::new_async().await;
        let tx_id = Uuid::new_v4();

        let mock = server
            .mock("POST", "/")
            .match_body(mockito::Matcher::PartialJson(json!({
                "transaction_id": tx_id,
                "amount": 5000
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status": 200, "reference": "abc"}"#)
            .create_async()
            .await;

        let outcome = client(server.url()).settle(tx_id, 5000).await;

        mock.assert_async().await;
        assert_eq!(
            outcome,
            SettlementOutcome::Success(json!({"status": 200, "reference": "abc"}))
        );
    }

    #[tokio::test]
    async fn test_settle_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(400)
            .with_body(r#"{"error": "account closed"}"#)
            .create_async()
            .await;

        let outcome = client(server.url()).settle(Uuid::new_v4(), 100).await;
        assert_eq!(
            outcome,
            SettlementOutcome::Rejected(json!({"error": "account closed"}))
        );
    }

    #[tokio::test]
    async fn test_settle_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let outcome = client(server.url()).settle(Uuid::new_v4(), 100).await;
        assert_eq!(
            outcome,
            SettlementOutcome::TransientFailure(json!({"raw": "unavailable"}))
        );
    }

    #[tokio::test]
    async fn test_connection_error_is_transient() {
        // Nothing listens on port 1.
        let outcome = client("http://127.0.0.1:1".to_string())
            .settle(Uuid::new_v4(), 100)
            .await;
        assert!(matches!(outcome, SettlementOutcome::TransientFailure(_)));
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let client = client(server.url());
        for _ in 0..3 {
            client.settle(Uuid::new_v4(), 100).await;
        }

        assert_eq!(client.circuit_state(), "open");
        let outcome = client.settle(Uuid::new_v4(), 100).await;
        assert_eq!(
            outcome,
            SettlementOutcome::TransientFailure(json!({"error": "Circuit breaker open"}))
        );
    }

    #[tokio::test]
    async fn test_refusal_does_not_trip_breaker() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(422)
            .create_async()
            .await;

        let client = client(server.url());
        for _ in 0..5 {
            client.settle(Uuid::new_v4(), 100).await;
        }
        assert_eq!(client.circuit_state(), "closed");
    }
}
