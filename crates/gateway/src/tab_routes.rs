//! `/tabs` routes.

use std::time::Duration;

use {
    axum::{
        Json,
        extract::{Path, Query, State},
        http::HeaderMap,
        response::Response,
    },
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    serde::Deserialize,
    serde_json::{Value, json},
};

use {
    camofox_browser::actions::Action,
    camofox_browser::resources::{BatchItem, BatchOptions, ExtractOptions},
    camofox_common::{CoreError, Result},
    camofox_engine::SeedOptions,
};

use crate::{auth::require_api_key, respond::respond, state::AppState};

/// Query parameters shared by the tab routes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabQuery {
    pub user_id: Option<String>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub full_page: bool,
}

/// `userId` from body or query; tab routes answer 404 when it is absent so
/// probing requests cannot distinguish "no such tab" from "not yours".
fn tab_user(query: &TabQuery, body: Option<&Value>) -> Result<String> {
    body.and_then(|b| b.get("userId"))
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| query.user_id.clone())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| CoreError::not_found("Tab not found"))
}

fn body_str(body: &Value, field: &str) -> Result<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::validation(format!("missing {field}")))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T> {
    serde_json::from_value(body.clone())
        .map_err(|e| CoreError::validation(format!("invalid request body: {e}")))
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTabBody {
    user_id: Option<String>,
    session_key: Option<String>,
    list_item_id: Option<String>,
    #[serde(default)]
    seed_options: Option<SeedOptions>,
}

pub async fn create_tab(State(state): State<AppState>, body: Json<Value>) -> Response {
    let result = async {
        let parsed: CreateTabBody = parse_body(&body)?;
        let user_id = parsed
            .user_id
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CoreError::validation("missing userId"))?;
        let group = parsed
            .session_key
            .or(parsed.list_item_id)
            .unwrap_or_else(|| "default".to_string());
        state
            .core
            .create_tab(&user_id, &group, parsed.seed_options)
            .await
    }
    .await;
    respond(&state, result)
}

pub async fn list_tabs(State(state): State<AppState>, Query(query): Query<TabQuery>) -> Response {
    let result = async {
        let user_id = query
            .user_id
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CoreError::validation("missing userId"))?;
        state.core.list_tabs(&user_id).await
    }
    .await;
    respond(&state, result)
}

pub async fn close_tab(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
    body: Option<Json<Value>>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, body.as_deref())?;
        state.core.close_tab(&user_id, &tab_id).await
    }
    .await;
    respond(&state, result)
}

pub async fn close_group(
    State(state): State<AppState>,
    Path(list_item_id): Path<String>,
    Query(query): Query<TabQuery>,
    body: Option<Json<Value>>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, body.as_deref())?;
        state.core.close_group(&user_id, &list_item_id).await
    }
    .await;
    respond(&state, result)
}

// ── Navigation & reading ─────────────────────────────────────────────────────

pub async fn navigate(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
    body: Json<Value>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, Some(&body))?;
        let url = body_str(&body, "url")?;
        state.core.navigate(&user_id, &tab_id, &url).await
    }
    .await;
    respond(&state, result)
}

pub async fn snapshot(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, None)?;
        state
            .core
            .snapshot(&user_id, &tab_id, query.offset.unwrap_or(0))
            .await
    }
    .await;
    respond(&state, result)
}

pub async fn links(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, None)?;
        state.core.links(&user_id, &tab_id).await
    }
    .await;
    respond(&state, result)
}

pub async fn screenshot(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, None)?;
        let png = state
            .core
            .screenshot(&user_id, &tab_id, query.full_page)
            .await?;
        Ok(json!({
            "ok": true,
            "contentType": "image/png",
            "data": BASE64.encode(&png),
        }))
    }
    .await;
    respond(&state, result)
}

pub async fn stats(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, None)?;
        let stats = state.core.stats(&user_id, &tab_id).await?;
        serde_json::to_value(stats).map_err(|e| CoreError::engine(e.to_string()))
    }
    .await;
    respond(&state, result)
}

pub async fn cookies(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, None)?;
        let cookies = state.core.cookies(&user_id, &tab_id).await?;
        Ok(json!({ "cookies": cookies }))
    }
    .await;
    respond(&state, result)
}

// ── Actions ──────────────────────────────────────────────────────────────────

/// Build the action for a single-purpose endpoint from its body.
fn action_from(kind: &str, body: &Value) -> Result<Action> {
    let mut raw = body.clone();
    let obj = raw
        .as_object_mut()
        .ok_or_else(|| CoreError::validation("request body must be a JSON object"))?;
    obj.insert("kind".to_string(), Value::String(kind.to_string()));
    obj.remove("userId");
    parse_body(&raw)
}

async fn run_action(
    state: AppState,
    tab_id: String,
    query: TabQuery,
    body: Option<Json<Value>>,
    kind: &str,
) -> Response {
    let empty = json!({});
    let body_value = body.as_deref().unwrap_or(&empty);
    let result = async {
        let user_id = tab_user(&query, Some(body_value))?;
        let action = action_from(kind, body_value)?;
        state.core.act(&user_id, &tab_id, action).await
    }
    .await;
    respond(&state, result)
}

macro_rules! action_handler {
    ($name:ident, $kind:literal) => {
        pub async fn $name(
            State(state): State<AppState>,
            Path(tab_id): Path<String>,
            Query(query): Query<TabQuery>,
            body: Option<Json<Value>>,
        ) -> Response {
            run_action(state, tab_id, query, body, $kind).await
        }
    };
}

action_handler!(click, "click");
action_handler!(type_text, "type");
action_handler!(press, "press");
action_handler!(scroll, "scroll");
action_handler!(scroll_element, "scrollElement");
action_handler!(hover, "hover");
action_handler!(wait, "wait");
action_handler!(back, "back");
action_handler!(forward, "forward");
action_handler!(refresh, "refresh");

// ── Evaluate ─────────────────────────────────────────────────────────────────

async fn run_evaluate(
    state: AppState,
    tab_id: String,
    query: TabQuery,
    headers: HeaderMap,
    body: Json<Value>,
    extended: bool,
) -> Response {
    let result = async {
        require_api_key(&state, &headers)?;
        let user_id = tab_user(&query, Some(&body))?;
        let expression = body_str(&body, "expression")?;
        let timeout = body
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);
        state
            .core
            .evaluate(&user_id, &tab_id, &expression, timeout, extended)
            .await
    }
    .await;
    respond(&state, result)
}

pub async fn evaluate(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
    headers: HeaderMap,
    body: Json<Value>,
) -> Response {
    run_evaluate(state, tab_id, query, headers, body, false).await
}

pub async fn evaluate_extended(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
    headers: HeaderMap,
    body: Json<Value>,
) -> Response {
    run_evaluate(state, tab_id, query, headers, body, true).await
}

// ── Resources ────────────────────────────────────────────────────────────────

pub async fn extract_resources(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
    body: Json<Value>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, Some(&body))?;
        let opts: ExtractOptions = parse_body(&body)?;
        state.core.extract_resources(&user_id, &tab_id, opts).await
    }
    .await;
    respond(&state, result)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchBody {
    #[serde(default)]
    items: Vec<BatchItem>,
    #[serde(default)]
    max_files: Option<usize>,
    #[serde(default)]
    resolve_blobs: bool,
}

pub async fn batch_download(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
    body: Json<Value>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, Some(&body))?;
        let parsed: BatchBody = parse_body(&body)?;
        if parsed.items.is_empty() {
            return Err(CoreError::validation("no items to download"));
        }
        let opts = BatchOptions {
            max_files: parsed.max_files,
            resolve_blobs: parsed.resolve_blobs,
        };
        state
            .core
            .batch_download(&user_id, &tab_id, parsed.items, opts)
            .await
    }
    .await;
    respond(&state, result)
}

pub async fn resolve_blobs(
    State(state): State<AppState>,
    Path(tab_id): Path<String>,
    Query(query): Query<TabQuery>,
    body: Json<Value>,
) -> Response {
    let result = async {
        let user_id = tab_user(&query, Some(&body))?;
        let urls: Vec<String> = body
            .get("urls")
            .and_then(Value::as_array)
            .map(|array| {
                array
                    .iter()
                    .filter_map(|u| u.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if urls.is_empty() {
            return Err(CoreError::validation("no blob URLs provided"));
        }
        state.core.resolve_blobs(&user_id, &tab_id, urls).await
    }
    .await;
    respond(&state, result)
}

