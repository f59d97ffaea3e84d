//! Health, presets, and the admin stop endpoint.

use {
    axum::{
        Json,
        extract::State,
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::info,
};

use crate::{auth::require_admin_key, respond::error_response, state::AppState};

/// Liveness plus the orchestrator gauges. Answers 503 while shutting down.
pub async fn health(State(state): State<AppState>) -> Response {
    if state.core.health.is_recovering() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "recovering": true })),
        )
            .into_response();
    }
    Json(state.core.health_payload().await).into_response()
}

/// Names of preset files, if a presets directory exists. Their contents are
/// consumed by clients, not by the control plane.
pub async fn presets(State(state): State<AppState>) -> Response {
    let names: Vec<String> = std::fs::read_dir(&state.core.config.presets_dir)
        .map(|entries| {
            let mut names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let name = entry.file_name().to_string_lossy().to_string();
                    name.strip_suffix(".json").map(String::from)
                })
                .collect();
            names.sort();
            names
        })
        .unwrap_or_default();
    Json(json!({ "presets": names })).into_response()
}

/// Flip into recovering mode, close everything, and exit.
pub async fn admin_stop(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = require_admin_key(&state, &headers) {
        return error_response(&state, e);
    }

    info!("admin stop requested, shutting down");
    let core = state.core.clone();
    tokio::spawn(async move {
        core.shutdown().await;
        std::process::exit(0);
    });
    Json(json!({ "ok": true, "stopping": true })).into_response()
}
