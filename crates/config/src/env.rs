//! `CAMOFOX_*` environment parsing.

use std::{env, path::PathBuf, time::Duration};

use {
    anyhow::{Context, bail},
    tracing::warn,
};

use crate::schema::{Config, HeadlessMode, ProxyConfig};

const ENV_PREFIX: &str = "CAMOFOX_";

fn var(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an integer tunable, falling back to `default` on garbage.
fn int_or<T: std::str::FromStr + std::fmt::Display + Copy>(name: &str, default: T) -> T {
    match var(name) {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = raw, %default, "invalid integer, using default");
                default
            }
        },
    }
}

fn millis_or(name: &str, default: Duration) -> Duration {
    Duration::from_millis(int_or(name, default.as_millis() as u64))
}

/// Read the full configuration from the environment.
///
/// Integer tunables fall back to their defaults with a warning. A malformed
/// port or an un-creatable directory is a hard error: the process has no
/// sensible way to run without them.
pub fn load_from_env() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let port = match var("PORT") {
        None => defaults.port,
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("CAMOFOX_PORT is not a valid port: {raw:?}"))?,
    };

    let profiles_dir = var("PROFILES_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.profiles_dir);
    let downloads_dir = var("DOWNLOADS_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.downloads_dir);
    let cookies_dir = var("COOKIES_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.cookies_dir);
    let presets_dir = var("PRESETS_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.presets_dir);

    for dir in [&profiles_dir, &downloads_dir, &cookies_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }

    let headless = match var("HEADLESS") {
        None => defaults.headless,
        Some(raw) => match raw.parse::<HeadlessMode>() {
            Ok(mode) => mode,
            Err(e) => {
                warn!(value = raw, error = e, "invalid CAMOFOX_HEADLESS, using headless");
                HeadlessMode::Headless
            }
        },
    };

    let proxy = match (var("PROXY_HOST"), var("PROXY_PORT")) {
        (Some(host), Some(port_raw)) => {
            let Ok(proxy_port) = port_raw.parse::<u16>() else {
                bail!("CAMOFOX_PROXY_PORT is not a valid port: {port_raw:?}");
            };
            Some(ProxyConfig {
                host,
                port: proxy_port,
                username: var("PROXY_USER"),
                password: var("PROXY_PASS"),
            })
        }
        (Some(_), None) | (None, Some(_)) => {
            bail!("CAMOFOX_PROXY_HOST and CAMOFOX_PROXY_PORT must be set together");
        }
        (None, None) => None,
    };

    let session_idle_timeout = millis_or("SESSION_IDLE_TIMEOUT_MS", defaults.session_idle_timeout)
        .max(Duration::from_secs(60));

    let max_batch_files = int_or("MAX_BATCH_FILES", defaults.max_batch_files).clamp(1, 500);

    Ok(Config {
        port,
        admin_key: var("ADMIN_KEY"),
        api_key: var("API_KEY"),
        profiles_dir,
        downloads_dir,
        cookies_dir,
        presets_dir,
        download_ttl: millis_or("DOWNLOAD_TTL_MS", defaults.download_ttl),
        max_download_size_mb: int_or("MAX_DOWNLOAD_SIZE_MB", defaults.max_download_size_mb),
        max_blob_size_mb: int_or("MAX_BLOB_SIZE_MB", defaults.max_blob_size_mb),
        max_downloads_per_user: int_or("MAX_DOWNLOADS_PER_USER", defaults.max_downloads_per_user),
        handler_timeout: millis_or("HANDLER_TIMEOUT_MS", defaults.handler_timeout),
        max_concurrent_per_user: int_or(
            "MAX_CONCURRENT_PER_USER",
            defaults.max_concurrent_per_user,
        ),
        max_snapshot_chars: int_or("MAX_SNAPSHOT_CHARS", defaults.max_snapshot_chars),
        snapshot_tail_chars: int_or("SNAPSHOT_TAIL_CHARS", defaults.snapshot_tail_chars),
        build_refs_timeout: millis_or("BUILD_REFS_TIMEOUT_MS", defaults.build_refs_timeout),
        tab_lock_timeout: millis_or("TAB_LOCK_TIMEOUT_MS", defaults.tab_lock_timeout),
        health_probe_interval: millis_or(
            "HEALTH_PROBE_INTERVAL_MS",
            defaults.health_probe_interval,
        ),
        failure_threshold: int_or("FAILURE_THRESHOLD", defaults.failure_threshold),
        max_contexts: int_or("MAX_CONTEXTS", defaults.max_contexts),
        max_sessions: int_or("MAX_SESSIONS", defaults.max_sessions),
        session_idle_timeout,
        eval_extended_rate_limit_max: int_or(
            "EVAL_EXTENDED_RATE_LIMIT_MAX",
            defaults.eval_extended_rate_limit_max,
        ),
        eval_extended_rate_limit_window: millis_or(
            "EVAL_EXTENDED_RATE_LIMIT_WINDOW_MS",
            defaults.eval_extended_rate_limit_window,
        ),
        max_batch_files,
        max_batch_concurrency: int_or("MAX_BATCH_CONCURRENCY", defaults.max_batch_concurrency),
        headless,
        proxy,
        production: var("ENV").as_deref() == Some("production"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; serialize them.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_env(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().unwrap();
        for (k, v) in vars {
            unsafe { env::set_var(format!("{ENV_PREFIX}{k}"), v) };
        }
        f();
        for (k, _) in vars {
            unsafe { env::remove_var(format!("{ENV_PREFIX}{k}")) };
        }
    }

    fn tmp_dirs(root: &std::path::Path) -> Vec<(&'static str, String)> {
        vec![
            ("PROFILES_DIR", root.join("p").display().to_string()),
            ("DOWNLOADS_DIR", root.join("d").display().to_string()),
            ("COOKIES_DIR", root.join("c").display().to_string()),
        ]
    }

    #[test]
    fn defaults_when_unset() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = tmp_dirs(tmp.path());
        let vars: Vec<(&str, &str)> = dirs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        with_env(&vars, || {
            let cfg = load_from_env().unwrap();
            assert_eq!(cfg.port, 9377);
            assert_eq!(cfg.max_downloads_per_user, 500);
            assert_eq!(cfg.max_concurrent_per_user, 3);
            assert_eq!(cfg.max_snapshot_chars, 80_000);
            assert_eq!(cfg.handler_timeout, Duration::from_secs(30));
            assert!(!cfg.production);
        });
    }

    #[test]
    fn invalid_integer_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = tmp_dirs(tmp.path());
        let mut vars: Vec<(&str, &str)> = dirs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        vars.push(("MAX_DOWNLOADS_PER_USER", "lots"));
        with_env(&vars, || {
            let cfg = load_from_env().unwrap();
            assert_eq!(cfg.max_downloads_per_user, 500);
        });
    }

    #[test]
    fn invalid_port_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = tmp_dirs(tmp.path());
        let mut vars: Vec<(&str, &str)> = dirs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        vars.push(("PORT", "eighty"));
        with_env(&vars, || {
            assert!(load_from_env().is_err());
        });
    }

    #[test]
    fn idle_timeout_clamped_to_minimum() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = tmp_dirs(tmp.path());
        let mut vars: Vec<(&str, &str)> = dirs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        vars.push(("SESSION_IDLE_TIMEOUT_MS", "1000"));
        with_env(&vars, || {
            let cfg = load_from_env().unwrap();
            assert_eq!(cfg.session_idle_timeout, Duration::from_secs(60));
        });
    }

    #[test]
    fn directories_are_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = tmp_dirs(tmp.path());
        let vars: Vec<(&str, &str)> = dirs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        with_env(&vars, || {
            load_from_env().unwrap();
            assert!(tmp.path().join("p").is_dir());
            assert!(tmp.path().join("d").is_dir());
            assert!(tmp.path().join("c").is_dir());
        });
    }

    #[test]
    fn proxy_requires_both_host_and_port() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = tmp_dirs(tmp.path());
        let mut vars: Vec<(&str, &str)> = dirs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        vars.push(("PROXY_HOST", "proxy.internal"));
        with_env(&vars, || {
            assert!(load_from_env().is_err());
        });
    }
}
