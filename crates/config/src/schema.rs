//! Config schema types.

use std::{path::PathBuf, str::FromStr, time::Duration};

use serde::Serialize;

/// How the browser engine is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadlessMode {
    /// No display at all.
    Headless,
    /// A real window on whatever display the process inherits.
    Headed,
    /// Headless engine flags tuned for an external virtual display.
    Virtual,
}

impl HeadlessMode {
    /// The mode toggle-display switches to from `self`.
    pub fn toggled(self) -> Self {
        match self {
            Self::Headless | Self::Headed => Self::Virtual,
            Self::Virtual => Self::Headless,
        }
    }
}

impl FromStr for HeadlessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "headless" => Ok(Self::Headless),
            "false" | "headed" => Ok(Self::Headed),
            "virtual" => Ok(Self::Virtual),
            other => Err(format!("invalid headless mode: {other}")),
        }
    }
}

/// Upstream proxy for browser traffic.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Immutable runtime configuration, parsed from the environment once at
/// startup by [`crate::load_from_env`].
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub port: u16,
    /// Guards the admin stop endpoint (`x-admin-key`).
    #[serde(skip)]
    pub admin_key: Option<String>,
    /// Guards script evaluation and cookie import (`Authorization: Bearer`).
    #[serde(skip)]
    pub api_key: Option<String>,

    pub profiles_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub cookies_dir: PathBuf,
    /// Search-macro preset files live here; listed, never parsed, by the
    /// control plane.
    pub presets_dir: PathBuf,

    pub download_ttl: Duration,
    pub max_download_size_mb: u64,
    pub max_blob_size_mb: u64,
    pub max_downloads_per_user: usize,

    pub handler_timeout: Duration,
    pub max_concurrent_per_user: usize,

    pub max_snapshot_chars: usize,
    pub snapshot_tail_chars: usize,
    pub build_refs_timeout: Duration,
    pub tab_lock_timeout: Duration,

    pub health_probe_interval: Duration,
    pub failure_threshold: u32,

    pub max_contexts: usize,
    pub max_sessions: usize,
    pub session_idle_timeout: Duration,

    pub eval_extended_rate_limit_max: u32,
    pub eval_extended_rate_limit_window: Duration,

    pub max_batch_files: usize,
    pub max_batch_concurrency: usize,

    pub headless: HeadlessMode,
    pub proxy: Option<ProxyConfig>,

    /// `production` hides engine error details from clients.
    pub production: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 9377,
            admin_key: None,
            api_key: None,
            profiles_dir: PathBuf::from("./data/profiles"),
            downloads_dir: PathBuf::from("./data/downloads"),
            cookies_dir: PathBuf::from("./data/cookies"),
            presets_dir: PathBuf::from("./data/presets"),
            download_ttl: Duration::from_millis(24 * 60 * 60 * 1000),
            max_download_size_mb: 100,
            max_blob_size_mb: 25,
            max_downloads_per_user: 500,
            handler_timeout: Duration::from_millis(30_000),
            max_concurrent_per_user: 3,
            max_snapshot_chars: 80_000,
            snapshot_tail_chars: 5_000,
            build_refs_timeout: Duration::from_millis(12_000),
            tab_lock_timeout: Duration::from_millis(30_000),
            health_probe_interval: Duration::from_millis(60_000),
            failure_threshold: 3,
            max_contexts: 50,
            max_sessions: 200,
            session_idle_timeout: Duration::from_millis(30 * 60 * 1000),
            eval_extended_rate_limit_max: 20,
            eval_extended_rate_limit_window: Duration::from_millis(60_000),
            max_batch_files: 50,
            max_batch_concurrency: 5,
            headless: HeadlessMode::Headless,
            proxy: None,
            production: false,
        }
    }
}

impl Config {
    pub fn max_download_size_bytes(&self) -> u64 {
        self.max_download_size_mb * 1024 * 1024
    }

    pub fn max_blob_size_bytes(&self) -> u64 {
        self.max_blob_size_mb * 1024 * 1024
    }

    /// Per-user download directory, keyed by the url-encoded user id so a
    /// crafted id cannot escape the downloads root.
    pub fn user_downloads_dir(&self, user_id: &str) -> PathBuf {
        self.downloads_dir
            .join(urlencoding::encode(user_id).into_owned())
    }

    /// Per-user browser profile directory, same encoding as downloads.
    pub fn user_profile_dir(&self, user_id: &str) -> PathBuf {
        self.profiles_dir
            .join(urlencoding::encode(user_id).into_owned())
    }
}
