//! `/sessions` routes.

use {
    axum::{
        Json,
        extract::{Path, State},
        http::HeaderMap,
        response::Response,
    },
    serde_json::Value,
};

use {camofox_common::CoreError, camofox_engine::Cookie};

use crate::{auth::require_api_key, respond::respond, state::AppState};

pub async fn close_user_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let result = state.core.close_user_sessions(&user_id).await;
    respond(&state, result)
}

/// Cookie import executes against the user's persistent context; it is
/// guarded like script evaluation.
pub async fn import_cookies(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    body: Json<Value>,
) -> Response {
    let result = async {
        require_api_key(&state, &headers)?;
        let cookies: Vec<Cookie> = body
            .get("cookies")
            .cloned()
            .ok_or_else(|| CoreError::validation("missing cookies"))
            .and_then(|raw| {
                serde_json::from_value(raw)
                    .map_err(|e| CoreError::validation(format!("invalid cookie shape: {e}")))
            })?;
        if cookies.is_empty() {
            return Err(CoreError::validation("no cookies to import"));
        }
        state.core.import_cookies(&user_id, cookies).await
    }
    .await;
    respond(&state, result)
}

pub async fn toggle_display(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let result = state.core.toggle_display(&user_id).await;
    respond(&state, result)
}
