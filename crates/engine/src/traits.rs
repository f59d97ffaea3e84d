//! The engine trait family.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    Result,
    types::{
        BoundingBox, Cookie, FetchedBody, LaunchOptions, LoadState, ScrollMetrics, ScrollRequest,
        Selector,
    },
};

/// Callback invoked when a page starts a download.
pub type DownloadHandler = Arc<dyn Fn(Arc<dyn EngineDownload>) + Send + Sync>;

/// Launches persistent browser contexts.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Launch (or attach to) a persistent context rooted at `profile_dir`.
    async fn launch_persistent(
        &self,
        profile_dir: &Path,
        opts: LaunchOptions,
    ) -> Result<Arc<dyn EngineContext>>;
}

/// A live browser context bound to one profile directory.
#[async_trait]
pub trait EngineContext: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn EnginePage>>;

    /// HTTP GET through the context (carries the context's cookies/proxy).
    async fn request_get(&self, url: &str, timeout: Duration) -> Result<FetchedBody>;

    async fn set_cookies(&self, cookies: Vec<Cookie>) -> Result<()>;
    async fn cookies(&self) -> Result<Vec<Cookie>>;

    async fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}

/// A single page (tab) inside a context.
#[async_trait]
pub trait EnginePage: Send + Sync {
    async fn goto(&self, url: &str, wait_until: LoadState, timeout: Duration) -> Result<()>;
    async fn current_url(&self) -> Result<String>;
    async fn title(&self) -> Result<String>;
    async fn reload(&self, timeout: Duration) -> Result<()>;
    async fn go_back(&self, timeout: Duration) -> Result<()>;
    async fn go_forward(&self, timeout: Duration) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;

    /// Evaluate a JS expression; `undefined` results surface as JSON null.
    async fn evaluate(&self, expr: &str) -> Result<serde_json::Value>;

    /// PNG bytes.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>>;

    async fn wait_for_load_state(&self, state: LoadState, timeout: Duration) -> Result<()>;

    async fn press_key(&self, key: &str) -> Result<()>;
    async fn mouse_move(&self, x: f64, y: f64) -> Result<()>;
    async fn mouse_down(&self) -> Result<()>;
    async fn mouse_up(&self) -> Result<()>;
    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64) -> Result<()>;

    /// Textual aria-tree serialization of the body subtree.
    async fn aria_snapshot(&self, timeout: Duration) -> Result<String>;

    async fn click(&self, sel: &Selector, force: bool, timeout: Duration) -> Result<()>;
    async fn fill(&self, sel: &Selector, text: &str, clear: bool, timeout: Duration)
    -> Result<()>;
    async fn hover(&self, sel: &Selector, timeout: Duration) -> Result<()>;
    async fn scroll_into_view(&self, sel: &Selector, timeout: Duration) -> Result<()>;
    async fn bounding_box(&self, sel: &Selector, timeout: Duration)
    -> Result<Option<BoundingBox>>;
    async fn is_visible(&self, sel: &Selector, timeout: Duration) -> Result<bool>;
    async fn scroll_element(&self, sel: &Selector, req: ScrollRequest) -> Result<ScrollMetrics>;

    /// Register the handler invoked for every download this page starts.
    fn set_download_handler(&self, handler: DownloadHandler);
}

/// One in-flight or finished download.
#[async_trait]
pub trait EngineDownload: Send + Sync {
    fn url(&self) -> String;
    fn suggested_filename(&self) -> String;

    /// Wait for the download to finish and persist it at `path`.
    async fn save_as(&self, path: &Path) -> Result<()>;

    /// Resolves once the download reaches a terminal state; `Some(reason)`
    /// when it failed or was canceled.
    async fn failure(&self) -> Option<String>;
}
