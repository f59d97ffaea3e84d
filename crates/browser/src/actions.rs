//! Ref-addressed page actions.
//!
//! Every mutating action is executed under the tab lock by the caller,
//! rebuilds refs on completion, and reports the page URL it left behind.

use std::{fmt, sync::Arc, time::Duration};

use {
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::debug,
};

use {
    camofox_common::{CoreError, Result},
    camofox_config::Config,
    camofox_engine::{EnginePage, LoadState, ScrollRequest, Selector},
};

use crate::{downloads::DownloadRegistry, registry::Tab, snapshot};

/// Per-stage click timeout.
const CLICK_TIMEOUT: Duration = Duration::from_secs(5);
/// Navigation settle budget.
const NAV_TIMEOUT: Duration = Duration::from_secs(20);
/// Downloads created this recently by the tab are inlined into the click
/// response.
const DOWNLOAD_INLINE_WINDOW: Duration = Duration::from_secs(3);
/// Longest a `wait` action may sleep.
const MAX_WAIT: Duration = Duration::from_secs(30);

const MAX_EXPRESSION_BYTES: usize = 64 * 1024;
const MAX_RESULT_BYTES: usize = 1024 * 1024;
const MIN_EVAL_TIMEOUT: Duration = Duration::from_millis(100);

fn default_clear() -> bool {
    true
}

fn default_scroll_delta() -> f64 {
    300.0
}

/// Absolute scroll target for scroll-element.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScrollTo {
    #[serde(default)]
    pub top: f64,
    #[serde(default)]
    pub left: f64,
}

/// A mutating tab action, dispatched on `kind`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    Click {
        #[serde(rename = "ref")]
        ref_id: String,
    },
    Type {
        #[serde(rename = "ref")]
        ref_id: String,
        text: String,
        #[serde(default = "default_clear")]
        clear: bool,
        #[serde(default)]
        press_enter: bool,
    },
    Press {
        key: String,
    },
    Scroll {
        #[serde(default)]
        delta_x: f64,
        #[serde(default = "default_scroll_delta")]
        delta_y: f64,
    },
    ScrollElement {
        #[serde(rename = "ref")]
        ref_id: String,
        #[serde(default)]
        scroll_to: Option<ScrollTo>,
        #[serde(default)]
        delta_x: Option<f64>,
        #[serde(default)]
        delta_y: Option<f64>,
    },
    Hover {
        #[serde(rename = "ref")]
        ref_id: String,
    },
    Wait {
        timeout_ms: u64,
    },
    Back,
    Forward,
    Refresh,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Click { ref_id } => write!(f, "click({ref_id})"),
            Self::Type { ref_id, .. } => write!(f, "type({ref_id})"),
            Self::Press { key } => write!(f, "press({key})"),
            Self::Scroll { delta_x, delta_y } => write!(f, "scroll({delta_x},{delta_y})"),
            Self::ScrollElement { ref_id, .. } => write!(f, "scroll_element({ref_id})"),
            Self::Hover { ref_id } => write!(f, "hover({ref_id})"),
            Self::Wait { timeout_ms } => write!(f, "wait({timeout_ms}ms)"),
            Self::Back => write!(f, "back"),
            Self::Forward => write!(f, "forward"),
            Self::Refresh => write!(f, "refresh"),
        }
    }
}

/// Reject anything that is not plain http(s) before it reaches the engine.
pub fn validate_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| CoreError::validation(format!("invalid URL {raw:?}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(CoreError::validation(format!(
            "unsupported URL scheme {scheme:?}, only http and https are allowed"
        ))),
    }
}

/// Rebuild the tab's ref table from a fresh snapshot; returns the ref count.
pub async fn rebuild_refs(tab: &Arc<Tab>, config: &Arc<Config>) -> usize {
    let (table, annotated) = snapshot::build_refs(&tab.page, config).await;
    let count = table.len();
    *tab.refs.lock().expect("refs lock") = table;
    *tab.last_snapshot.lock().expect("snapshot lock") = Some(annotated);
    count
}

fn resolve_ref(tab: &Tab, ref_id: &str) -> Result<Selector> {
    tab.refs.lock().expect("refs lock").to_selector(ref_id)
}

/// Navigate the tab. Refs are invalidated atomically before the rebuild so a
/// concurrent reader never resolves stale refs against the new page.
pub async fn navigate(tab: &Arc<Tab>, config: &Arc<Config>, url: &str) -> Result<Value> {
    validate_url(url)?;

    tab.page
        .goto(url, LoadState::DomContentLoaded, NAV_TIMEOUT)
        .await
        .map_err(|e| CoreError::engine(e.to_string()))?;

    tab.invalidate_refs();
    let refs_count = rebuild_refs(tab, config).await;

    let landed = tab
        .page
        .current_url()
        .await
        .map_err(|e| CoreError::engine(e.to_string()))?;
    tab.record_visit(&landed);
    let title = tab.page.title().await.unwrap_or_default();

    Ok(json!({
        "ok": true,
        "url": landed,
        "title": title,
        "refsCount": refs_count,
    }))
}

/// Click with three-stage escalation: a normal trusted click, `force` when
/// the failure smells like pointer-event interception, and finally a raw
/// synthetic mouse sequence at the element center.
async fn click_with_escalation(page: &Arc<dyn EnginePage>, sel: &Selector) -> Result<()> {
    let first = match page.click(sel, false, CLICK_TIMEOUT).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    if !first.to_string().contains("intercept") {
        return Err(CoreError::engine(first.to_string()));
    }
    debug!(?sel, "click intercepted, escalating to force");
    if page.click(sel, true, CLICK_TIMEOUT).await.is_ok() {
        return Ok(());
    }

    debug!(?sel, "forced click failed, falling back to synthetic mouse");
    let bounds = page
        .bounding_box(sel, CLICK_TIMEOUT)
        .await
        .map_err(|e| CoreError::engine(e.to_string()))?
        .ok_or_else(|| CoreError::engine("element has no bounding box"))?;
    let (x, y) = bounds.center();
    let steps: Result<()> = async {
        page.mouse_move(x, y)
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        page.mouse_down()
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        page.mouse_up()
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;
        Ok(())
    }
    .await;
    steps
}

/// Execute one action against a tab the caller has already locked.
pub async fn execute(
    tab: &Arc<Tab>,
    config: &Arc<Config>,
    downloads: &Arc<DownloadRegistry>,
    action: Action,
) -> Result<Value> {
    tab.record_tool_call();
    let page = Arc::clone(&tab.page);

    match action {
        Action::Click { ref_id } => {
            let sel = resolve_ref(tab, &ref_id)?;
            click_with_escalation(&page, &sel).await?;

            let refs_count = rebuild_refs(tab, config).await;
            let url = page.current_url().await.unwrap_or_default();
            tab.record_visit(&url);

            let recent = downloads.recent_for_tab(&tab.id, DOWNLOAD_INLINE_WINDOW);
            let mut body = json!({ "ok": true, "url": url, "refsCount": refs_count });
            if !recent.is_empty() {
                body["downloads"] = serde_json::to_value(recent)
                    .map_err(|e| CoreError::engine(e.to_string()))?;
            }
            Ok(body)
        }

        Action::Type {
            ref_id,
            text,
            clear,
            press_enter,
        } => {
            let sel = resolve_ref(tab, &ref_id)?;
            page.fill(&sel, &text, clear, CLICK_TIMEOUT)
                .await
                .map_err(|e| CoreError::engine(e.to_string()))?;
            if press_enter {
                page.press_key("Enter")
                    .await
                    .map_err(|e| CoreError::engine(e.to_string()))?;
            }
            after_mutation(tab, config).await
        }

        Action::Press { key } => {
            page.press_key(&key)
                .await
                .map_err(|e| CoreError::engine(e.to_string()))?;
            after_mutation(tab, config).await
        }

        Action::Scroll { delta_x, delta_y } => {
            page.mouse_wheel(delta_x, delta_y)
                .await
                .map_err(|e| CoreError::engine(e.to_string()))?;
            after_mutation(tab, config).await
        }

        Action::ScrollElement {
            ref_id,
            scroll_to,
            delta_x,
            delta_y,
        } => {
            let sel = resolve_ref(tab, &ref_id)?;
            let request = match scroll_to {
                Some(target) => ScrollRequest::To {
                    top: target.top,
                    left: target.left,
                },
                None => ScrollRequest::By {
                    delta_x: delta_x.unwrap_or(0.0),
                    delta_y: delta_y.unwrap_or(default_scroll_delta()),
                },
            };
            let metrics = page
                .scroll_element(&sel, request)
                .await
                .map_err(|e| CoreError::engine(e.to_string()))?;
            let refs_count = rebuild_refs(tab, config).await;
            Ok(json!({
                "ok": true,
                "metrics": metrics,
                "refsCount": refs_count,
            }))
        }

        Action::Hover { ref_id } => {
            let sel = resolve_ref(tab, &ref_id)?;
            page.hover(&sel, CLICK_TIMEOUT)
                .await
                .map_err(|e| CoreError::engine(e.to_string()))?;
            after_mutation(tab, config).await
        }

        Action::Wait { timeout_ms } => {
            let wait = Duration::from_millis(timeout_ms).min(MAX_WAIT);
            tokio::time::sleep(wait).await;
            Ok(json!({ "ok": true, "waitedMs": wait.as_millis() as u64 }))
        }

        Action::Back => history_step(tab, config, HistoryOp::Back).await,
        Action::Forward => history_step(tab, config, HistoryOp::Forward).await,
        Action::Refresh => history_step(tab, config, HistoryOp::Refresh).await,
    }
}

async fn after_mutation(tab: &Arc<Tab>, config: &Arc<Config>) -> Result<Value> {
    let refs_count = rebuild_refs(tab, config).await;
    let url = tab.page.current_url().await.unwrap_or_default();
    Ok(json!({ "ok": true, "url": url, "refsCount": refs_count }))
}

enum HistoryOp {
    Back,
    Forward,
    Refresh,
}

async fn history_step(tab: &Arc<Tab>, config: &Arc<Config>, op: HistoryOp) -> Result<Value> {
    let step = match op {
        HistoryOp::Back => tab.page.go_back(NAV_TIMEOUT).await,
        HistoryOp::Forward => tab.page.go_forward(NAV_TIMEOUT).await,
        HistoryOp::Refresh => tab.page.reload(NAV_TIMEOUT).await,
    };
    step.map_err(|e| CoreError::engine(e.to_string()))?;
    tab.invalidate_refs();
    let refs_count = rebuild_refs(tab, config).await;
    let url = tab.page.current_url().await.unwrap_or_default();
    tab.record_visit(&url);
    Ok(json!({ "ok": true, "url": url, "refsCount": refs_count }))
}

// ── Evaluate ─────────────────────────────────────────────────────────────────

/// Shared implementation behind `/evaluate` and `/evaluate-extended`.
///
/// Never returns `Err` for script-level problems: timeouts and JS errors are
/// part of the response shape. Only an oversized expression is rejected up
/// front.
pub async fn evaluate(
    page: &Arc<dyn EnginePage>,
    expression: &str,
    timeout: Option<Duration>,
    max_timeout: Duration,
) -> Result<Value> {
    if expression.len() > MAX_EXPRESSION_BYTES {
        return Err(CoreError::validation(format!(
            "expression of {} bytes exceeds the {MAX_EXPRESSION_BYTES}-byte limit",
            expression.len()
        )));
    }

    let timeout = timeout
        .unwrap_or(max_timeout)
        .clamp(MIN_EVAL_TIMEOUT, max_timeout);

    let evaluated = tokio::time::timeout(timeout, page.evaluate(expression)).await;

    match evaluated {
        Err(_) => Ok(json!({
            "ok": false,
            "errorType": "timeout",
            "error": format!("evaluation exceeded {}ms", timeout.as_millis()),
        })),
        Ok(Err(e)) => Ok(json!({
            "ok": false,
            "errorType": "js_error",
            "error": e.to_string(),
        })),
        Ok(Ok(value)) => {
            let serialized = serde_json::to_string(&value)
                .map_err(|e| CoreError::engine(format!("result serialization failed: {e}")))?;
            if serialized.len() > MAX_RESULT_BYTES {
                return Ok(json!({
                    "ok": true,
                    "value": format!(
                        "[result of {} bytes omitted, exceeds the {MAX_RESULT_BYTES}-byte limit]",
                        serialized.len()
                    ),
                    "resultType": result_type(&value),
                    "truncated": true,
                }));
            }
            Ok(json!({
                "ok": true,
                "value": value,
                "resultType": result_type(&value),
                "truncated": false,
            }))
        }
    }
}

fn result_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_gate_accepts_only_http_schemes() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://localhost:8080/path?q=1").is_ok());
        for bad in [
            "ftp://example.com",
            "file:///etc/passwd",
            "javascript:alert(1)",
            "data:text/html,hi",
            "not a url",
            "",
        ] {
            let err = validate_url(bad).unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn action_wire_format_dispatches_on_kind() {
        let action: Action =
            serde_json::from_str(r#"{"kind":"click","ref":"e3"}"#).unwrap();
        assert!(matches!(action, Action::Click { ref_id } if ref_id == "e3"));

        let action: Action =
            serde_json::from_str(r#"{"kind":"type","ref":"e1","text":"hi"}"#).unwrap();
        match action {
            Action::Type {
                clear, press_enter, ..
            } => {
                assert!(clear);
                assert!(!press_enter);
            }
            other => panic!("unexpected action {other}"),
        }

        let action: Action = serde_json::from_str(r#"{"kind":"scroll"}"#).unwrap();
        assert!(matches!(
            action,
            Action::Scroll { delta_x, delta_y } if delta_x == 0.0 && delta_y == 300.0
        ));

        let action: Action = serde_json::from_str(
            r#"{"kind":"scrollElement","ref":"e2","scrollTo":{"top":100,"left":0}}"#,
        )
        .unwrap();
        assert!(matches!(action, Action::ScrollElement { .. }));
    }

    #[test]
    fn result_type_covers_every_shape() {
        assert_eq!(result_type(&json!(null)), "null");
        assert_eq!(result_type(&json!(true)), "boolean");
        assert_eq!(result_type(&json!(3.5)), "number");
        assert_eq!(result_type(&json!("x")), "string");
        assert_eq!(result_type(&json!([1])), "array");
        assert_eq!(result_type(&json!({"a": 1})), "object");
    }
}
