//! Chrome/Chromium over CDP via chromiumoxide.
//!
//! One browser process per persistent context: the profile directory IS the
//! context, which is what keeps per-user state alive across restarts.

mod scripts;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    chromiumoxide::{
        Browser, BrowserConfig, Page,
        cdp::browser_protocol::{
            browser::{
                DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
                SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
            },
            emulation::{SetGeolocationOverrideParams, SetTimezoneOverrideParams},
            input::{
                DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
                DispatchMouseEventType, MouseButton,
            },
            network::CookieParam,
            page::CaptureScreenshotFormat,
            storage::{GetCookiesParams, SetCookiesParams},
        },
    },
    futures::StreamExt,
    tokio::sync::{Mutex, watch},
    tracing::{debug, warn},
};

use crate::{
    Result,
    error::EngineError,
    traits::{DownloadHandler, Engine, EngineContext, EngineDownload, EnginePage},
    types::{
        BoundingBox, Cookie, FetchedBody, LaunchOptions, LoadState, ScrollMetrics, ScrollRequest,
        Selector,
    },
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Launches one Chromium process per profile directory.
pub struct CdpEngine {
    chrome_path: Option<PathBuf>,
    extra_args: Vec<String>,
}

impl CdpEngine {
    pub fn new() -> Self {
        Self {
            chrome_path: None,
            extra_args: Vec::new(),
        }
    }

    pub fn with_chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

impl Default for CdpEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for CdpEngine {
    async fn launch_persistent(
        &self,
        profile_dir: &Path,
        opts: LaunchOptions,
    ) -> Result<Arc<dyn EngineContext>> {
        tokio::fs::create_dir_all(profile_dir).await?;

        let mut builder = BrowserConfig::builder().user_data_dir(profile_dir);

        // chromiumoxide is headless by default; with_head() opens a window.
        if !opts.headless && !opts.virtual_display {
            builder = builder.with_head();
        }

        if let Some(vp) = opts.seed.viewport {
            builder = builder.viewport(chromiumoxide::handler::viewport::Viewport {
                width: vp.width,
                height: vp.height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            });
        }

        if let Some(ref locale) = opts.seed.locale {
            builder = builder.arg(format!("--lang={locale}"));
        }

        if let Some(ref proxy) = opts.proxy {
            builder = builder.arg(format!("--proxy-server={}:{}", proxy.host, proxy.port));
        }

        if let Some(ref path) = self.chrome_path {
            builder = builder.chrome_executable(path);
        }

        for arg in &self.extra_args {
            builder = builder.arg(arg);
        }

        builder = builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-software-rasterizer")
            .arg("--no-sandbox")
            .arg("--disable-setuid-sandbox");

        let config = builder
            .build()
            .map_err(|e| EngineError::LaunchFailed(format!("invalid browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| EngineError::LaunchFailed(e.to_string()))?;

        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_pump = Arc::clone(&closed);
        let profile = profile_dir.display().to_string();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!(profile, ?event, "browser event");
            }
            // Handler exits when the CDP connection drops.
            closed_for_pump.store(true, Ordering::SeqCst);
            debug!(profile, "browser event handler exited");
        });

        Ok(Arc::new(CdpContext {
            browser: Mutex::new(browser),
            closed,
            seed: opts.seed,
            downloads_dir: opts.downloads_dir,
        }))
    }
}

struct CdpContext {
    browser: Mutex<Browser>,
    closed: Arc<AtomicBool>,
    seed: crate::types::SeedOptions,
    downloads_dir: Option<PathBuf>,
}

impl CdpContext {
    async fn raw_page(&self) -> Result<Page> {
        if self.is_closed() {
            return Err(EngineError::ContextClosed);
        }
        let browser = self.browser.lock().await;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))
    }
}

#[async_trait]
impl EngineContext for CdpContext {
    async fn new_page(&self) -> Result<Arc<dyn EnginePage>> {
        let page = self.raw_page().await?;

        if let Some(ref tz) = self.seed.timezone_id {
            let cmd = SetTimezoneOverrideParams::builder()
                .timezone_id(tz.clone())
                .build()
                .map_err(EngineError::Cdp)?;
            if let Err(e) = page.execute(cmd).await {
                warn!(timezone = tz, error = %e, "failed to apply timezone override");
            }
        }

        if let Some(geo) = self.seed.geolocation {
            let cmd = SetGeolocationOverrideParams::builder()
                .latitude(geo.latitude)
                .longitude(geo.longitude)
                .accuracy(1.0)
                .build();
            if let Err(e) = page.execute(cmd).await {
                warn!(error = %e, "failed to apply geolocation override");
            }
        }

        let downloads = Arc::new(StdMutex::new(HashMap::new()));
        let handler_slot: Arc<StdMutex<Option<DownloadHandler>>> = Arc::new(StdMutex::new(None));

        if let Some(ref dir) = self.downloads_dir {
            tokio::fs::create_dir_all(dir).await?;
            let cmd = SetDownloadBehaviorParams::builder()
                .behavior(SetDownloadBehaviorBehavior::Allow)
                .download_path(dir.display().to_string())
                .events_enabled(true)
                .build()
                .map_err(EngineError::Cdp)?;
            page.execute(cmd)
                .await
                .map_err(|e| EngineError::Cdp(e.to_string()))?;

            spawn_download_pump(
                &page,
                dir.clone(),
                Arc::clone(&downloads),
                Arc::clone(&handler_slot),
            )
            .await?;
        }

        Ok(Arc::new(CdpPage {
            page,
            closed: AtomicBool::new(false),
            mouse_pos: StdMutex::new((0.0, 0.0)),
            download_handler: handler_slot,
            _downloads: downloads,
        }))
    }

    async fn request_get(&self, url: &str, timeout: Duration) -> Result<FetchedBody> {
        let parsed = url::Url::parse(url)
            .map_err(|e| EngineError::FetchFailed(format!("invalid url {url:?}: {e}")))?;
        let origin = parsed.origin().ascii_serialization();

        let page = self.raw_page().await?;
        let result = tokio::time::timeout(timeout, async {
            // Fetch from the resource's own origin so cookies apply and
            // same-origin requests bypass CORS.
            page.goto(origin.as_str())
                .await
                .map_err(|e| EngineError::FetchFailed(e.to_string()))?;
            let encoded_url = serde_json::to_string(url)
                .map_err(|e| EngineError::FetchFailed(e.to_string()))?;
            let script = scripts::FETCH_JS.replace("%URL%", &encoded_url);
            let value = page
                .evaluate(script.as_str())
                .await
                .map_err(|e| EngineError::FetchFailed(e.to_string()))?
                .into_value::<serde_json::Value>()
                .map_err(|e| EngineError::FetchFailed(format!("{e:?}")))?;
            let status = value["status"].as_u64().unwrap_or(0) as u16;
            let content_type = value["contentType"].as_str().map(String::from);
            let bytes = BASE64
                .decode(value["base64"].as_str().unwrap_or_default())
                .map_err(|e| EngineError::FetchFailed(format!("bad base64 body: {e}")))?;
            Ok::<_, EngineError>(FetchedBody {
                status,
                content_type,
                bytes,
            })
        })
        .await
        .map_err(|_| EngineError::Timeout(format!("fetch of {url} timed out")));

        let _ = page.close().await;
        result?
    }

    async fn set_cookies(&self, cookies: Vec<Cookie>) -> Result<()> {
        let params: Vec<CookieParam> = cookies
            .into_iter()
            .map(|c| {
                let mut b = CookieParam::builder().name(c.name).value(c.value);
                if let Some(domain) = c.domain {
                    b = b.domain(domain);
                }
                if let Some(path) = c.path {
                    b = b.path(path);
                }
                if let Some(expires) = c.expires {
                    b = b.expires(chromiumoxide::cdp::browser_protocol::network::TimeSinceEpoch::new(expires));
                }
                b.http_only(c.http_only).secure(c.secure).build()
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(EngineError::Cdp)?;

        let page = self.raw_page().await?;
        let result = page
            .execute(SetCookiesParams::new(params))
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Cdp(e.to_string()));
        let _ = page.close().await;
        result
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let page = self.raw_page().await?;
        let result = page
            .execute(GetCookiesParams::default())
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()));
        let _ = page.close().await;

        let reply = result?;
        Ok(reply
            .result
            .cookies
            .iter()
            .map(|c| Cookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: Some(c.domain.clone()),
                path: Some(c.path.clone()),
                expires: Some(c.expires),
                http_only: c.http_only,
                secure: c.secure,
                same_site: c.same_site.as_ref().map(|s| format!("{s:?}")),
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut browser = self.browser.lock().await;
        browser
            .close()
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?;
        let _ = browser.wait().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ── Downloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadState {
    InProgress,
    Completed,
    Canceled,
}

type DownloadMap = Arc<StdMutex<HashMap<String, watch::Sender<DownloadState>>>>;

async fn spawn_download_pump(
    page: &Page,
    dir: PathBuf,
    downloads: DownloadMap,
    handler_slot: Arc<StdMutex<Option<DownloadHandler>>>,
) -> Result<()> {
    let mut will_begin = page
        .event_listener::<EventDownloadWillBegin>()
        .await
        .map_err(|e| EngineError::Cdp(e.to_string()))?;
    let mut progress = page
        .event_listener::<EventDownloadProgress>()
        .await
        .map_err(|e| EngineError::Cdp(e.to_string()))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                ev = will_begin.next() => {
                    let Some(ev) = ev else { break };
                    let (tx, rx) = watch::channel(DownloadState::InProgress);
                    downloads
                        .lock()
                        .expect("download map lock")
                        .insert(ev.guid.clone(), tx);
                    let download = Arc::new(CdpDownload {
                        url: ev.url.clone(),
                        suggested_filename: ev.suggested_filename.clone(),
                        spool_path: dir.join(&ev.guid),
                        state: rx,
                    });
                    let handler = handler_slot.lock().expect("handler lock").clone();
                    match handler {
                        Some(h) => h(download),
                        None => debug!(url = ev.url, "download started with no handler registered"),
                    }
                }
                ev = progress.next() => {
                    let Some(ev) = ev else { break };
                    let state = match ev.state {
                        DownloadProgressState::Completed => DownloadState::Completed,
                        DownloadProgressState::Canceled => DownloadState::Canceled,
                        DownloadProgressState::InProgress => continue,
                    };
                    if let Some(tx) = downloads.lock().expect("download map lock").remove(&ev.guid) {
                        let _ = tx.send(state);
                    }
                }
            }
        }
    });

    Ok(())
}

struct CdpDownload {
    url: String,
    suggested_filename: String,
    /// Where the engine spools the bytes while downloading.
    spool_path: PathBuf,
    state: watch::Receiver<DownloadState>,
}

impl CdpDownload {
    async fn wait_terminal(&self) -> DownloadState {
        let mut rx = self.state.clone();
        loop {
            let current = *rx.borrow();
            if current != DownloadState::InProgress {
                return current;
            }
            if rx.changed().await.is_err() {
                // Pump gone before a terminal event.
                return DownloadState::Canceled;
            }
        }
    }
}

#[async_trait]
impl EngineDownload for CdpDownload {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn suggested_filename(&self) -> String {
        self.suggested_filename.clone()
    }

    async fn save_as(&self, path: &Path) -> Result<()> {
        match self.wait_terminal().await {
            DownloadState::Completed => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                // rename fails across filesystems; fall back to copy.
                if tokio::fs::rename(&self.spool_path, path).await.is_err() {
                    tokio::fs::copy(&self.spool_path, path).await?;
                    let _ = tokio::fs::remove_file(&self.spool_path).await;
                }
                Ok(())
            }
            DownloadState::Canceled => {
                Err(EngineError::DownloadFailed("download canceled".into()))
            }
            DownloadState::InProgress => unreachable!("wait_terminal returned in-progress"),
        }
    }

    async fn failure(&self) -> Option<String> {
        match self.wait_terminal().await {
            DownloadState::Completed => None,
            DownloadState::Canceled => Some("download canceled".into()),
            DownloadState::InProgress => unreachable!("wait_terminal returned in-progress"),
        }
    }
}

// ── Page ─────────────────────────────────────────────────────────────────────

struct CdpPage {
    page: Page,
    closed: AtomicBool,
    mouse_pos: StdMutex<(f64, f64)>,
    download_handler: Arc<StdMutex<Option<DownloadHandler>>>,
    _downloads: DownloadMap,
}

impl CdpPage {
    fn spec_json(sel: &Selector) -> String {
        match sel {
            Selector::Css(css) => serde_json::json!({ "css": css }).to_string(),
            Selector::Role { role, name, nth } => {
                serde_json::json!({ "role": role, "name": name, "nth": nth }).to_string()
            }
        }
    }

    async fn eval(&self, script: &str) -> Result<serde_json::Value> {
        if self.is_closed() {
            return Err(EngineError::PageClosed);
        }
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| EngineError::JsEvalFailed(e.to_string()))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn eval_spec(&self, template: &str, sel: &Selector) -> Result<serde_json::Value> {
        self.eval(&scripts::with_spec(template, &Self::spec_json(sel)))
            .await
    }

    async fn dispatch_mouse(&self, params: DispatchMouseEventParams) -> Result<()> {
        self.page
            .execute(params)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Cdp(e.to_string()))
    }

    async fn center_of(&self, sel: &Selector, timeout: Duration) -> Result<(f64, f64)> {
        match self.bounding_box(sel, timeout).await? {
            Some(b) => Ok(b.center()),
            None => Err(EngineError::ElementNotFound(format!("{sel:?}"))),
        }
    }

    /// Trusted click: scroll into view, then a full mouse event sequence at
    /// the element center.
    async fn raw_click(&self, sel: &Selector, timeout: Duration) -> Result<()> {
        self.scroll_into_view(sel, timeout).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (x, y) = self.center_of(sel, timeout).await?;
        self.mouse_move(x, y).await?;
        self.mouse_down().await?;
        self.mouse_up().await?;
        Ok(())
    }
}

#[async_trait]
impl EnginePage for CdpPage {
    async fn goto(&self, url: &str, wait_until: LoadState, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::PageClosed);
        }
        let started = Instant::now();
        tokio::time::timeout(timeout, async {
            self.page
                .goto(url)
                .await
                .map_err(|e| EngineError::NavigationFailed(e.to_string()))?;
            let _ = self.page.wait_for_navigation().await;
            Ok::<_, EngineError>(())
        })
        .await
        .map_err(|_| EngineError::Timeout(format!("navigation to {url} timed out")))??;

        let remaining = timeout.saturating_sub(started.elapsed());
        if !remaining.is_zero() {
            let _ = self.wait_for_load_state(wait_until, remaining).await;
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&self) -> Result<String> {
        Ok(self
            .page
            .get_title()
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?
            .unwrap_or_default())
    }

    async fn reload(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            self.page
                .reload()
                .await
                .map_err(|e| EngineError::NavigationFailed(e.to_string()))?;
            let _ = self.page.wait_for_navigation().await;
            Ok::<_, EngineError>(())
        })
        .await
        .map_err(|_| EngineError::Timeout("reload timed out".into()))?
    }

    async fn go_back(&self, timeout: Duration) -> Result<()> {
        self.eval("history.back()").await?;
        let _ = self
            .wait_for_load_state(LoadState::DomContentLoaded, timeout)
            .await;
        Ok(())
    }

    async fn go_forward(&self, timeout: Duration) -> Result<()> {
        self.eval("history.forward()").await?;
        let _ = self
            .wait_for_load_state(LoadState::DomContentLoaded, timeout)
            .await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn evaluate(&self, expr: &str) -> Result<serde_json::Value> {
        self.eval(expr).await
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>> {
        self.page
            .screenshot(
                chromiumoxide::page::ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(full_page)
                    .build(),
            )
            .await
            .map_err(|e| EngineError::ScreenshotFailed(e.to_string()))
    }

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<()> {
        let check = match state {
            LoadState::DomContentLoaded => "document.readyState !== 'loading'",
            LoadState::Load => "document.readyState === 'complete'",
            LoadState::NetworkIdle => {
                "(() => { if (document.readyState !== 'complete') return false; \
                 const rs = performance.getEntriesByType('resource'); \
                 if (!rs.length) return true; \
                 return performance.now() - rs[rs.length - 1].responseEnd > 500; })()"
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            if self.eval(check).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "load state {state:?} not reached in {timeout:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let text = match key {
            "Enter" => Some("\r".to_string()),
            "Tab" => Some("\t".to_string()),
            k if k.chars().count() == 1 => Some(k.to_string()),
            _ => None,
        };

        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key);
        if let Some(ref t) = text {
            down = down.text(t.clone());
        }
        self.page
            .execute(down.build().map_err(EngineError::Cdp)?)
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?;

        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key)
            .build()
            .map_err(EngineError::Cdp)?;
        self.page
            .execute(up)
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?;
        Ok(())
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        *self.mouse_pos.lock().expect("mouse pos lock") = (x, y);
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(x)
            .y(y)
            .build()
            .map_err(EngineError::Cdp)?;
        self.dispatch_mouse(cmd).await
    }

    async fn mouse_down(&self) -> Result<()> {
        let (x, y) = *self.mouse_pos.lock().expect("mouse pos lock");
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MousePressed)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(EngineError::Cdp)?;
        self.dispatch_mouse(cmd).await
    }

    async fn mouse_up(&self) -> Result<()> {
        let (x, y) = *self.mouse_pos.lock().expect("mouse pos lock");
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseReleased)
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1)
            .build()
            .map_err(EngineError::Cdp)?;
        self.dispatch_mouse(cmd).await
    }

    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> Result<()> {
        let (x, y) = *self.mouse_pos.lock().expect("mouse pos lock");
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x)
            .y(y)
            .delta_x(delta_x)
            .delta_y(delta_y)
            .build()
            .map_err(EngineError::Cdp)?;
        self.dispatch_mouse(cmd).await
    }

    async fn aria_snapshot(&self, timeout: Duration) -> Result<String> {
        let script = scripts::ARIA_SNAPSHOT_JS.replace("%HELPERS%", scripts::HELPERS_JS);
        let value = tokio::time::timeout(timeout, self.eval(&script))
            .await
            .map_err(|_| EngineError::Timeout("aria snapshot timed out".into()))??;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn click(&self, sel: &Selector, force: bool, timeout: Duration) -> Result<()> {
        if force {
            let ok = self.eval_spec(scripts::FORCE_CLICK_JS, sel).await?;
            if ok.as_bool() != Some(true) {
                return Err(EngineError::ElementNotFound(format!("{sel:?}")));
            }
            return Ok(());
        }
        tokio::time::timeout(timeout, self.raw_click(sel, timeout))
            .await
            .map_err(|_| EngineError::Timeout(format!("click on {sel:?} timed out")))?
    }

    async fn fill(
        &self,
        sel: &Selector,
        text: &str,
        clear: bool,
        _timeout: Duration,
    ) -> Result<()> {
        let encoded_text =
            serde_json::to_string(text).map_err(|e| EngineError::JsEvalFailed(e.to_string()))?;
        let script = scripts::with_spec(scripts::FILL_JS, &Self::spec_json(sel))
            .replace("%TEXT%", &encoded_text)
            .replace("%CLEAR%", if clear { "true" } else { "false" });
        let ok = self.eval(&script).await?;
        if ok.as_bool() != Some(true) {
            return Err(EngineError::ElementNotFound(format!("{sel:?}")));
        }
        Ok(())
    }

    async fn hover(&self, sel: &Selector, timeout: Duration) -> Result<()> {
        self.scroll_into_view(sel, timeout).await?;
        let (x, y) = self.center_of(sel, timeout).await?;
        self.mouse_move(x, y).await
    }

    async fn scroll_into_view(&self, sel: &Selector, _timeout: Duration) -> Result<()> {
        let ok = self.eval_spec(scripts::SCROLL_INTO_VIEW_JS, sel).await?;
        if ok.as_bool() != Some(true) {
            return Err(EngineError::ElementNotFound(format!("{sel:?}")));
        }
        Ok(())
    }

    async fn bounding_box(
        &self,
        sel: &Selector,
        _timeout: Duration,
    ) -> Result<Option<BoundingBox>> {
        let value = self.eval_spec(scripts::BOUNDING_BOX_JS, sel).await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(BoundingBox {
            x: value["x"].as_f64().unwrap_or(0.0),
            y: value["y"].as_f64().unwrap_or(0.0),
            width: value["width"].as_f64().unwrap_or(0.0),
            height: value["height"].as_f64().unwrap_or(0.0),
        }))
    }

    async fn is_visible(&self, sel: &Selector, timeout: Duration) -> Result<bool> {
        let value = tokio::time::timeout(timeout, self.eval_spec(scripts::IS_VISIBLE_JS, sel))
            .await
            .map_err(|_| EngineError::Timeout("visibility probe timed out".into()))??;
        Ok(value.as_bool() == Some(true))
    }

    async fn scroll_element(&self, sel: &Selector, req: ScrollRequest) -> Result<ScrollMetrics> {
        let req_json = match req {
            ScrollRequest::To { top, left } => {
                serde_json::json!({ "to": { "top": top, "left": left } })
            }
            ScrollRequest::By { delta_x, delta_y } => {
                serde_json::json!({ "by": { "deltaX": delta_x, "deltaY": delta_y } })
            }
        };
        let script = scripts::with_spec(scripts::SCROLL_ELEMENT_JS, &Self::spec_json(sel))
            .replace("%REQ%", &req_json.to_string());
        let value = self.eval(&script).await?;
        if value.is_null() {
            return Err(EngineError::ElementNotFound(format!("{sel:?}")));
        }
        Ok(ScrollMetrics {
            scroll_top: value["scrollTop"].as_f64().unwrap_or(0.0),
            scroll_left: value["scrollLeft"].as_f64().unwrap_or(0.0),
            scroll_width: value["scrollWidth"].as_f64().unwrap_or(0.0),
            scroll_height: value["scrollHeight"].as_f64().unwrap_or(0.0),
            client_width: value["clientWidth"].as_f64().unwrap_or(0.0),
            client_height: value["clientHeight"].as_f64().unwrap_or(0.0),
        })
    }

    fn set_download_handler(&self, handler: DownloadHandler) {
        *self.download_handler.lock().expect("handler lock") = Some(handler);
    }
}
