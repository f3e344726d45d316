use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Instant;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_BODY_LOG_SIZE: usize = 16 * 1024;

fn log_request_body() -> bool {
    std::env::var("LOG_REQUEST_BODY")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false)
}

/// Buffers a body small enough to log and returns it with its log form.
/// Larger or unbounded bodies are passed through untouched with a marker.
async fn capture_body(body: Body) -> Result<(Body, String), axum::Error> {
    match body.size_hint().upper() {
        Some(len) if len as usize <= MAX_BODY_LOG_SIZE => {
            let bytes = axum::body::to_bytes(body, MAX_BODY_LOG_SIZE).await?;
            let logged = match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(json) => json.to_string(),
                Err(_) => format!("[non-json, {} bytes]", bytes.len()),
            };
            Ok((Body::from(bytes), logged))
        }
        Some(len) => Ok((body, format!("[not logged, {} bytes]", len))),
        None => Ok((body, "[not logged, streaming body]".to_string())),
    }
}

/// Access log. Reuses the caller's `x-request-id` when it sends one.
pub async fn request_logger_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header_value = HeaderValue::from_str(&request_id).ok();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();

    if let Some(value) = &header_value {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    if log_request_body() {
        let (parts, body) = req.into_parts();
        let (body, logged) = match capture_body(body).await {
            Ok(captured) => captured,
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    method = %method,
                    uri = %uri,
                    error = %e,
                    "Failed to read request body"
                );
                return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
            }
        };

        tracing::info!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            body = %logged,
            "Incoming request"
        );

        req = Request::from_parts(parts, body);
    } else {
        tracing::info!(
            request_id = %request_id,
            method = %method,
            uri = %uri,
            "Incoming request"
        );
    }

    let mut response = next.run(req).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Outgoing response"
    );

    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
