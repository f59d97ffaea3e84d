//! Deterministic in-memory engine.
//!
//! Serves canned "sites" (aria text + title + click navigation edges) keyed
//! by URL, so orchestrator and gateway tests run without a browser binary.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    Result,
    error::EngineError,
    traits::{DownloadHandler, Engine, EngineContext, EngineDownload, EnginePage},
    types::{
        BoundingBox, Cookie, FetchedBody, LaunchOptions, LoadState, ScrollMetrics, ScrollRequest,
        Selector,
    },
};

/// Hook deciding what `evaluate` returns; defaults to `true` for every
/// script so readiness probes settle immediately.
pub type EvalHook = Arc<dyn Fn(&str) -> Result<serde_json::Value> + Send + Sync>;

/// A canned page the fake engine serves.
#[derive(Debug, Clone, Default)]
pub struct FakeSite {
    pub title: String,
    pub aria: String,
    /// `"role:name"` → URL navigated to when that element is clicked.
    pub click_nav: HashMap<String, String>,
    /// `"role:name"` → download (suggested filename, bytes) started on click.
    pub click_download: HashMap<String, (String, Vec<u8>)>,
}

impl FakeSite {
    pub fn new(title: impl Into<String>, aria: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            aria: aria.into(),
            click_nav: HashMap::new(),
            click_download: HashMap::new(),
        }
    }

    pub fn with_click_nav(
        mut self,
        role: &str,
        name: &str,
        target: impl Into<String>,
    ) -> Self {
        self.click_nav.insert(format!("{role}:{name}"), target.into());
        self
    }

    pub fn with_click_download(
        mut self,
        role: &str,
        name: &str,
        suggested: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.click_download
            .insert(format!("{role}:{name}"), (suggested.into(), bytes));
        self
    }
}

struct FakeEngineInner {
    sites: StdMutex<HashMap<String, FakeSite>>,
    fetch_bodies: StdMutex<HashMap<String, FetchedBody>>,
    eval_hook: StdMutex<Option<EvalHook>>,
    eval_delay: StdMutex<Option<Duration>>,
    launches: AtomicUsize,
    launch_delay: StdMutex<Option<Duration>>,
    fail_next_launch: AtomicBool,
}

/// Scriptable in-memory [`Engine`].
#[derive(Clone)]
pub struct FakeEngine {
    inner: Arc<FakeEngineInner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeEngineInner {
                sites: StdMutex::new(HashMap::new()),
                fetch_bodies: StdMutex::new(HashMap::new()),
                eval_hook: StdMutex::new(None),
                eval_delay: StdMutex::new(None),
                launches: AtomicUsize::new(0),
                launch_delay: StdMutex::new(None),
                fail_next_launch: AtomicBool::new(false),
            }),
        }
    }

    pub fn add_site(&self, url: impl Into<String>, site: FakeSite) {
        self.inner.sites.lock().unwrap().insert(url.into(), site);
    }

    pub fn set_fetch_body(&self, url: impl Into<String>, body: FetchedBody) {
        self.inner
            .fetch_bodies
            .lock()
            .unwrap()
            .insert(url.into(), body);
    }

    pub fn set_eval_hook(&self, hook: EvalHook) {
        *self.inner.eval_hook.lock().unwrap() = Some(hook);
    }

    /// Delay every `evaluate` call; handy for exercising timeout races.
    pub fn set_eval_delay(&self, delay: Duration) {
        *self.inner.eval_delay.lock().unwrap() = Some(delay);
    }

    pub fn clear_eval_delay(&self) {
        *self.inner.eval_delay.lock().unwrap() = None;
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.inner.launch_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_next_launch(&self) {
        self.inner.fail_next_launch.store(true, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn launch_persistent(
        &self,
        profile_dir: &Path,
        _opts: LaunchOptions,
    ) -> Result<Arc<dyn EngineContext>> {
        let delay = *self.inner.launch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(EngineError::LaunchFailed("fake launch failure".into()));
        }
        self.inner.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeContext {
            engine: Arc::clone(&self.inner),
            profile_dir: profile_dir.to_path_buf(),
            cookies: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeContext {
    engine: Arc<FakeEngineInner>,
    #[allow(dead_code)]
    profile_dir: PathBuf,
    cookies: StdMutex<Vec<Cookie>>,
    closed: AtomicBool,
}

#[async_trait]
impl EngineContext for FakeContext {
    async fn new_page(&self) -> Result<Arc<dyn EnginePage>> {
        if self.is_closed() {
            return Err(EngineError::ContextClosed);
        }
        Ok(Arc::new(FakePage {
            engine: Arc::clone(&self.engine),
            url: StdMutex::new("about:blank".to_string()),
            history: StdMutex::new((vec!["about:blank".to_string()], 0)),
            actions: StdMutex::new(Vec::new()),
            download_handler: StdMutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    async fn request_get(&self, url: &str, _timeout: Duration) -> Result<FetchedBody> {
        self.engine
            .fetch_bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| EngineError::FetchFailed(format!("no canned body for {url}")))
    }

    async fn set_cookies(&self, cookies: Vec<Cookie>) -> Result<()> {
        self.cookies.lock().unwrap().extend(cookies);
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        Ok(self.cookies.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakePage {
    engine: Arc<FakeEngineInner>,
    url: StdMutex<String>,
    history: StdMutex<(Vec<String>, usize)>,
    actions: StdMutex<Vec<String>>,
    download_handler: StdMutex<Option<DownloadHandler>>,
    closed: AtomicBool,
}

impl FakePage {
    fn record(&self, action: impl Into<String>) {
        self.actions.lock().unwrap().push(action.into());
    }

    /// Everything this page was asked to do, in order.
    pub fn action_log(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn site(&self) -> Option<FakeSite> {
        let url = self.url.lock().unwrap().clone();
        self.engine.sites.lock().unwrap().get(&url).cloned()
    }

    fn navigate_to(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
        let mut history = self.history.lock().unwrap();
        let pos = history.1;
        history.0.truncate(pos + 1);
        history.0.push(url.to_string());
        history.1 = history.0.len() - 1;
    }

    /// How many elements in the current aria text match `(role, name)`.
    fn count_matches(&self, role: &str, name: &str) -> usize {
        let Some(site) = self.site() else { return 0 };
        let needle = if name.is_empty() {
            format!("- {role}")
        } else {
            format!("- {role} \"{name}\"")
        };
        site.aria
            .lines()
            .filter(|line| line.trim_start().starts_with(&needle))
            .count()
    }

    fn resolve(&self, sel: &Selector) -> Result<(String, String)> {
        match sel {
            Selector::Css(css) => Ok(("css".to_string(), css.clone())),
            Selector::Role { role, name, nth } => {
                if *nth >= self.count_matches(role, name) {
                    return Err(EngineError::ElementNotFound(format!(
                        "{role} \"{name}\" #{nth}"
                    )));
                }
                Ok((role.clone(), name.clone()))
            }
        }
    }

    fn fire_download(&self, download: FakeDownload) {
        let handler = self.download_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(Arc::new(download));
        }
    }
}

#[async_trait]
impl EnginePage for FakePage {
    async fn goto(&self, url: &str, _wait_until: LoadState, _timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::PageClosed);
        }
        self.record(format!("goto:{url}"));
        self.navigate_to(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.site().map(|s| s.title).unwrap_or_default())
    }

    async fn reload(&self, _timeout: Duration) -> Result<()> {
        self.record("reload");
        Ok(())
    }

    async fn go_back(&self, _timeout: Duration) -> Result<()> {
        self.record("back");
        let mut history = self.history.lock().unwrap();
        if history.1 > 0 {
            history.1 -= 1;
            let url = history.0[history.1].clone();
            drop(history);
            *self.url.lock().unwrap() = url;
        }
        Ok(())
    }

    async fn go_forward(&self, _timeout: Duration) -> Result<()> {
        self.record("forward");
        let mut history = self.history.lock().unwrap();
        if history.1 + 1 < history.0.len() {
            history.1 += 1;
            let url = history.0[history.1].clone();
            drop(history);
            *self.url.lock().unwrap() = url;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn evaluate(&self, expr: &str) -> Result<serde_json::Value> {
        if self.is_closed() {
            return Err(EngineError::PageClosed);
        }
        let delay = *self.engine.eval_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let hook = self.engine.eval_hook.lock().unwrap().clone();
        match hook {
            Some(hook) => hook(expr),
            None => Ok(serde_json::Value::Bool(true)),
        }
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>> {
        // PNG signature followed by nothing useful.
        Ok(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])
    }

    async fn wait_for_load_state(&self, _state: LoadState, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.record(format!("press:{key}"));
        Ok(())
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        self.record(format!("mouse_move:{x},{y}"));
        Ok(())
    }

    async fn mouse_down(&self) -> Result<()> {
        self.record("mouse_down");
        Ok(())
    }

    async fn mouse_up(&self) -> Result<()> {
        self.record("mouse_up");
        Ok(())
    }

    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> Result<()> {
        self.record(format!("mouse_wheel:{delta_x},{delta_y}"));
        Ok(())
    }

    async fn aria_snapshot(&self, _timeout: Duration) -> Result<String> {
        Ok(self.site().map(|s| s.aria).unwrap_or_default())
    }

    async fn click(&self, sel: &Selector, force: bool, _timeout: Duration) -> Result<()> {
        let (role, name) = self.resolve(sel)?;
        self.record(format!("click:{role}:{name}:force={force}"));
        if let Some(site) = self.site() {
            let key = format!("{role}:{name}");
            if let Some((suggested, bytes)) = site.click_download.get(&key) {
                let url = self.url.lock().unwrap().clone();
                self.fire_download(FakeDownload::new(&url, suggested, bytes.clone()));
            }
            if let Some(target) = site.click_nav.get(&key) {
                let target = target.clone();
                self.navigate_to(&target);
            }
        }
        Ok(())
    }

    async fn fill(
        &self,
        sel: &Selector,
        text: &str,
        clear: bool,
        _timeout: Duration,
    ) -> Result<()> {
        let (role, name) = self.resolve(sel)?;
        self.record(format!("fill:{role}:{name}:{text}:clear={clear}"));
        Ok(())
    }

    async fn hover(&self, sel: &Selector, _timeout: Duration) -> Result<()> {
        let (role, name) = self.resolve(sel)?;
        self.record(format!("hover:{role}:{name}"));
        Ok(())
    }

    async fn scroll_into_view(&self, sel: &Selector, _timeout: Duration) -> Result<()> {
        let (role, name) = self.resolve(sel)?;
        self.record(format!("scroll_into_view:{role}:{name}"));
        Ok(())
    }

    async fn bounding_box(
        &self,
        sel: &Selector,
        _timeout: Duration,
    ) -> Result<Option<BoundingBox>> {
        match self.resolve(sel) {
            Ok(_) => Ok(Some(BoundingBox {
                x: 10.0,
                y: 10.0,
                width: 100.0,
                height: 20.0,
            })),
            Err(_) => Ok(None),
        }
    }

    async fn is_visible(&self, sel: &Selector, _timeout: Duration) -> Result<bool> {
        match sel {
            // Consent probes use CSS selectors; the fake has no overlays.
            Selector::Css(_) => Ok(false),
            Selector::Role { role, name, nth } => Ok(*nth < self.count_matches(role, name)),
        }
    }

    async fn scroll_element(&self, sel: &Selector, req: ScrollRequest) -> Result<ScrollMetrics> {
        self.resolve(sel)?;
        let (top, left) = match req {
            ScrollRequest::To { top, left } => (top, left),
            ScrollRequest::By { delta_x, delta_y } => (delta_y, delta_x),
        };
        self.record(format!("scroll_element:{top},{left}"));
        Ok(ScrollMetrics {
            scroll_top: top,
            scroll_left: left,
            scroll_width: 2000.0,
            scroll_height: 4000.0,
            client_width: 1280.0,
            client_height: 720.0,
        })
    }

    fn set_download_handler(&self, handler: DownloadHandler) {
        *self.download_handler.lock().unwrap() = Some(handler);
    }
}

/// A scripted download, usable directly in registry tests.
pub struct FakeDownload {
    url: String,
    suggested: String,
    bytes: Vec<u8>,
    fail: Option<String>,
}

impl FakeDownload {
    pub fn new(url: &str, suggested: &str, bytes: Vec<u8>) -> Self {
        Self {
            url: url.to_string(),
            suggested: suggested.to_string(),
            bytes,
            fail: None,
        }
    }

    pub fn failed(url: &str, suggested: &str, reason: &str) -> Self {
        Self {
            url: url.to_string(),
            suggested: suggested.to_string(),
            bytes: Vec::new(),
            fail: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl EngineDownload for FakeDownload {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn suggested_filename(&self) -> String {
        self.suggested.clone()
    }

    async fn save_as(&self, path: &Path) -> Result<()> {
        if let Some(ref reason) = self.fail {
            return Err(EngineError::DownloadFailed(reason.clone()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &self.bytes).await?;
        Ok(())
    }

    async fn failure(&self) -> Option<String> {
        self.fail.clone()
    }
}
