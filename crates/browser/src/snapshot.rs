//! Snapshot → refs → annotated text.
//!
//! The aria snapshot is parsed line by line; interactive nodes get stable
//! `eN` refs recorded as `(role, name, nth)` so later actions can resolve
//! them back to locators. The heuristics here are load-bearing: clients
//! pattern-match the `[eN]` markers and depend on the exact skip rules.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {regex::Regex, tracing::debug};

use {
    camofox_common::{CoreError, Result},
    camofox_config::Config,
    camofox_engine::{EnginePage, LoadState, Selector},
};

use crate::types::{RefInfo, SnapshotWindow};

/// Roles that receive refs. Everything else is display-only.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "checkbox",
    "radio",
    "menuitem",
    "tab",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
];

/// Hard cap on refs per snapshot.
const MAX_REFS: usize = 500;

const HYDRATION_ATTEMPTS: u32 = 40;
const HYDRATION_INTERVAL: Duration = Duration::from_millis(250);

/// readyState is complete and the resource-timing tail has been quiet for
/// 400ms.
const HYDRATION_PROBE_JS: &str = r#"
(() => {
    if (document.readyState !== 'complete') return false;
    const entries = performance.getEntriesByType('resource');
    if (!entries.length) return true;
    const last = entries[entries.length - 1];
    return performance.now() - last.responseEnd > 400;
})()
"#;

const TWO_FRAMES_JS: &str = r#"
new Promise((resolve) => requestAnimationFrame(() => requestAnimationFrame(resolve)))
"#;

// ── Ref table ────────────────────────────────────────────────────────────────

/// refId → `(role, name, nth)` for the current page state.
#[derive(Debug, Default)]
pub struct RefTable {
    refs: HashMap<String, RefInfo>,
    counter: usize,
}

impl RefTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_next(&mut self, info: RefInfo) -> String {
        self.counter += 1;
        let ref_id = format!("e{}", self.counter);
        self.refs.insert(ref_id.clone(), info);
        ref_id
    }

    pub fn get(&self, ref_id: &str) -> Option<&RefInfo> {
        self.refs.get(ref_id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn clear(&mut self) {
        self.refs.clear();
        self.counter = 0;
    }

    /// Link refs: `(refId, name, href-less)` pairs for the links endpoint.
    pub fn links(&self) -> Vec<(String, RefInfo)> {
        let mut links: Vec<(String, RefInfo)> = self
            .refs
            .iter()
            .filter(|(_, info)| info.role == "link")
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();
        links.sort_by_key(|(id, _)| id[1..].parse::<usize>().unwrap_or(0));
        links
    }

    /// Resolve a ref back to a role locator.
    ///
    /// Refs do not survive navigation; unknown ids tell the caller to take a
    /// fresh snapshot.
    pub fn to_selector(&self, ref_id: &str) -> Result<Selector> {
        match self.refs.get(ref_id) {
            Some(info) => Ok(Selector::Role {
                role: info.role.clone(),
                name: info.name.clone(),
                nth: info.nth,
            }),
            None => Err(CoreError::validation(if self.counter == 0 {
                format!(
                    "unknown ref {ref_id:?}: no refs on this page yet, take a fresh snapshot"
                )
            } else {
                format!(
                    "unknown ref {ref_id:?}: valid refs are e1..e{}; refs do not survive \
                     navigation, take a fresh snapshot",
                    self.counter
                )
            })),
        }
    }
}

// ── Parsing & annotation ─────────────────────────────────────────────────────

fn line_regex() -> &'static Regex {
    static LINE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    LINE.get_or_init(|| {
        Regex::new(r#"^(\s*)-\s+([A-Za-z]+)(\s+"([^"]*)")?"#).expect("snapshot line regex")
    })
}

fn name_blocklist() -> &'static Regex {
    static BLOCK: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    BLOCK.get_or_init(|| {
        Regex::new(r"(?i)date|calendar|picker|datepicker").expect("name blocklist regex")
    })
}

/// Whether a `(role, name)` pair gets a ref at all.
fn is_eligible(role: &str, name: &str) -> bool {
    // Comboboxes drag in date pickers and other composite widgets.
    if role == "combobox" {
        return false;
    }
    if name_blocklist().is_match(name) {
        return false;
    }
    INTERACTIVE_ROLES.contains(&role)
}

/// One pass over the snapshot: build the ref table and the annotated text
/// with `[eN]` markers, using identical skip rules and `nth` counting.
pub fn parse_and_annotate(yaml: &str) -> (RefTable, String) {
    let mut table = RefTable::new();
    let mut nth_counts: HashMap<(String, String), usize> = HashMap::new();
    let mut annotated = Vec::with_capacity(yaml.lines().count());

    for line in yaml.lines() {
        let Some(caps) = line_regex().captures(line) else {
            annotated.push(line.to_string());
            continue;
        };
        let role = caps[2].to_lowercase();
        let name = caps.get(4).map(|m| m.as_str()).unwrap_or("");

        if table.len() >= MAX_REFS || !is_eligible(&role, name) {
            annotated.push(line.to_string());
            continue;
        }

        let nth_key = (role.clone(), name.to_string());
        let nth = *nth_counts
            .entry(nth_key)
            .and_modify(|n| *n += 1)
            .or_insert(0);

        let ref_id = table.insert_next(RefInfo {
            role,
            name: name.to_string(),
            nth,
        });

        let matched_end = caps.get(0).expect("whole match").end();
        let (head, rest) = line.split_at(matched_end);
        annotated.push(format!("{head} [{ref_id}]{rest}"));
    }

    (table, annotated.join("\n"))
}

// ── Windowing ────────────────────────────────────────────────────────────────

/// Paginate an annotated snapshot.
///
/// The final `tail_chars` of the text are always appended so refs at the
/// bottom of long pages stay addressable from any window.
pub fn window(yaml: &str, offset: usize, max_chars: usize, tail_chars: usize) -> SnapshotWindow {
    let chars: Vec<char> = yaml.chars().collect();
    let total = chars.len();

    if total <= max_chars {
        return SnapshotWindow {
            text: yaml.to_string(),
            truncated: false,
            total_chars: total,
            offset: 0,
            has_more: false,
            next_offset: None,
        };
    }

    let tail = tail_chars.min(total);
    let content_budget = (max_chars.saturating_sub(tail + 200)).max(100);
    let clamped_offset = offset.min(total - tail);

    let content_end = (clamped_offset + content_budget).min(total - tail);
    let has_more = content_end < total - tail;

    let mut text: String = chars[clamped_offset..content_end].iter().collect();
    if has_more {
        text.push_str(&format!(
            "\n... [truncated at char {content_end} of {total}; next offset = {content_end}] ...\n"
        ));
    }
    text.extend(chars[total - tail..].iter());

    SnapshotWindow {
        text,
        truncated: true,
        total_chars: total,
        offset: clamped_offset,
        has_more,
        next_offset: has_more.then_some(content_end),
    }
}

// ── Page readiness ───────────────────────────────────────────────────────────

/// Best-effort settle: DOM content loaded, a short network-idle wait, a
/// bounded hydration loop, then two animation frames. Failures are ignored —
/// a snapshot of a half-loaded page beats no snapshot.
pub async fn wait_for_ready(page: &Arc<dyn EnginePage>) {
    let _ = page
        .wait_for_load_state(LoadState::DomContentLoaded, Duration::from_secs(10))
        .await;
    let _ = page
        .wait_for_load_state(LoadState::NetworkIdle, Duration::from_secs(3))
        .await;

    for _ in 0..HYDRATION_ATTEMPTS {
        match page.evaluate(HYDRATION_PROBE_JS).await {
            Ok(value) if value.as_bool() == Some(true) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        tokio::time::sleep(HYDRATION_INTERVAL).await;
    }

    let _ = page.evaluate(TWO_FRAMES_JS).await;
}

/// Consent / overlay dismissal targets, tried in order.
fn consent_targets() -> Vec<Selector> {
    let mut targets: Vec<Selector> = [
        "#onetrust-accept-btn-handler",
        "#onetrust-reject-all-handler",
        "#onetrust-close-btn-container button",
        r#"[aria-label="Accept all"]"#,
        r#"[aria-label="Close"]"#,
        r#"[aria-label="Dismiss"]"#,
        r#"[class*="consent"] button[class*="accept"]"#,
        r#"[class*="consent"] button[class*="close"]"#,
        r#"[class*="privacy"] button[class*="accept"]"#,
        r#"[class*="cookie"] button[class*="accept"]"#,
        r#"[class*="modal"] button[class*="close"]"#,
        r#"[class*="overlay"] button[class*="close"]"#,
    ]
    .into_iter()
    .map(|css| Selector::Css(css.to_string()))
    .collect();

    for label in ["Close", "Accept", "I Accept", "Got it", "OK"] {
        targets.push(Selector::role("button", label, 0));
    }
    targets
}

/// Best-effort click through the consent target list: 100ms visibility
/// probe, 1s click timeout, failures skipped silently.
pub async fn dismiss_consent(page: &Arc<dyn EnginePage>) {
    for target in consent_targets() {
        let visible = page
            .is_visible(&target, Duration::from_millis(100))
            .await
            .unwrap_or(false);
        if !visible {
            continue;
        }
        if page.click(&target, false, Duration::from_secs(1)).await.is_ok() {
            debug!(?target, "dismissed consent element");
        }
    }
}

/// Full pipeline: readiness, consent dismissal, snapshot (with one retry),
/// parse. Never fails — both snapshot failures yield an empty table.
pub async fn build_refs(page: &Arc<dyn EnginePage>, config: &Config) -> (RefTable, String) {
    wait_for_ready(page).await;
    dismiss_consent(page).await;

    let yaml = match page.aria_snapshot(config.build_refs_timeout).await {
        Ok(yaml) => yaml,
        Err(first) => {
            debug!(error = %first, "aria snapshot failed, retrying after load");
            let _ = page
                .wait_for_load_state(LoadState::Load, Duration::from_secs(5))
                .await;
            page.aria_snapshot(config.build_refs_timeout)
                .await
                .unwrap_or_default()
        }
    };

    parse_and_annotate(&yaml)
}
