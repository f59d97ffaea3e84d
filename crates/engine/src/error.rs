//! Engine error types.

use thiserror::Error;

/// Errors that can occur while driving a browser engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("navigation failed: {0}")]
    NavigationFailed(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("JavaScript evaluation failed: {0}")]
    JsEvalFailed(String),

    #[error("screenshot failed: {0}")]
    ScreenshotFailed(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("page closed")]
    PageClosed,

    #[error("context closed")]
    ContextClosed,

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Substrings that indicate the CDP WebSocket connection is dead.
const STALE_CONNECTION_PATTERNS: &[&str] = &[
    "receiver is gone",
    "oneshot canceled",
    "Request timed out",
    "Connection closed",
    "AlreadyClosed",
    "closed connection",
];

impl EngineError {
    /// Returns `true` when this error indicates the connection to the browser
    /// is dead and the owning context should be relaunched.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::PageClosed | Self::ContextClosed => true,
            Self::Cdp(msg)
            | Self::NavigationFailed(msg)
            | Self::JsEvalFailed(msg)
            | Self::ScreenshotFailed(msg)
            | Self::Timeout(msg) => STALE_CONNECTION_PATTERNS.iter().any(|p| msg.contains(p)),
            _ => false,
        }
    }
}

impl From<chromiumoxide::error::CdpError> for EngineError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        EngineError::Cdp(err.to_string())
    }
}
