//! Download routes.

use {
    axum::{
        extract::{Path, Query, State},
        http::header,
        response::{IntoResponse, Response},
    },
    serde::Deserialize,
    serde_json::json,
};

use camofox_common::CoreError;

use crate::{
    respond::{error_response, respond},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub user_id: Option<String>,
}

fn require_user(query: &DownloadQuery) -> camofox_common::Result<String> {
    query
        .user_id
        .clone()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| CoreError::validation("missing userId"))
}

pub async fn tab_downloads(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let result = async {
        let user_id = require_user(&query)?;
        // Ownership gate: the tab must exist for this user.
        state
            .core
            .sessions
            .find_tab(&tab_id, &user_id)
            .await
            .ok_or_else(|| CoreError::not_found("Tab not found"))?;
        let downloads = state.core.downloads.list_for_tab(&user_id, &tab_id);
        Ok(json!({ "downloads": downloads }))
    }
    .await;
    respond(&state, result)
}

pub async fn user_downloads(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    let downloads = state.core.downloads.list_for_user(&user_id);
    respond(&state, Ok(json!({ "downloads": downloads })))
}

pub async fn get_download(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let result = async {
        let user_id = require_user(&query)?;
        let info = state.core.downloads.get(&download_id, &user_id)?;
        serde_json::to_value(info).map_err(|e| CoreError::engine(e.to_string()))
    }
    .await;
    respond(&state, result)
}

pub async fn delete_download(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let result = async {
        let user_id = require_user(&query)?;
        state.core.downloads.delete(&download_id, &user_id).await?;
        Ok(json!({ "ok": true }))
    }
    .await;
    respond(&state, result)
}

/// Stream a completed download's bytes with its recorded MIME type.
pub async fn download_content(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let outcome = async {
        let user_id = require_user(&query)?;
        let (info, path) = state.core.downloads.content_path(&download_id, &user_id)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| CoreError::not_found("download file missing on disk"))?;
        Ok((info, bytes))
    }
    .await;

    match outcome {
        Ok((info, bytes)) => (
            [
                (header::CONTENT_TYPE, info.mime_type.clone()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", info.suggested_filename),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => error_response(&state, e),
    }
}
