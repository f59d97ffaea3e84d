//! Core-result → HTTP response mapping.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use {camofox_common::CoreError, serde_json::Value};

use crate::state::AppState;

/// Map a core result to a response. Engine/internal error details are hidden
/// in production; every error body is `{"error": "..."}`.
pub fn respond(state: &AppState, result: camofox_common::Result<Value>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => error_response(state, e),
    }
}

pub fn error_response(state: &AppState, error: CoreError) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if !error.is_client_safe() && state.production() {
        tracing::error!(error = %error, "internal error");
        "internal error".to_string()
    } else {
        if !error.is_client_safe() {
            tracing::error!(error = %error, "internal error");
        }
        error.to_string()
    };

    let body = Json(serde_json::json!({ "error": message }));
    match error.retry_after() {
        Some(retry_after) => {
            let seconds = retry_after.as_secs().max(1).to_string();
            (
                status,
                [(header::RETRY_AFTER, seconds)],
                Json(serde_json::json!({
                    "error": message,
                    "retryAfterMs": retry_after.as_millis() as u64,
                })),
            )
                .into_response()
        }
        None => (status, body).into_response(),
    }
}
