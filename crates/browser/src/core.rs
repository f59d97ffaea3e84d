//! The owned core: every process-wide singleton wired together.

use std::{
    future::Future,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use {
    serde_json::{Value, json},
    tracing::{info, warn},
};

use {
    camofox_common::{CoreError, Result},
    camofox_config::Config,
    camofox_engine::{Cookie, Engine, EnginePage, SeedOptions},
};

use crate::{
    actions::{self, Action},
    downloads::DownloadRegistry,
    health::HealthTracker,
    limiter::UserLimiter,
    pool::ContextPool,
    rate_limit::RateLimiter,
    registry::{SessionRegistry, Tab},
    resources::{self, BatchItem, BatchOptions, ExtractOptions},
    snapshot,
    tab_lock::TabLocks,
    types::TabStats,
};

/// How long a page close may take before we abandon it.
const PAGE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Extended-evaluate budget; the regular path uses the handler timeout.
const EVAL_EXTENDED_TIMEOUT: Duration = Duration::from_secs(300);

/// Close a page without ever failing or hanging: the close races a timer,
/// and errors are logged rather than propagated.
pub async fn safe_page_close(page: Arc<dyn EnginePage>) {
    match tokio::time::timeout(PAGE_CLOSE_TIMEOUT, page.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "page close failed"),
        Err(_) => warn!("page close timed out"),
    }
}

/// Process-wide state: config, engine, and every orchestrator singleton.
pub struct Core {
    pub config: Arc<Config>,
    pub pool: Arc<ContextPool>,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: UserLimiter,
    pub tab_locks: Arc<TabLocks>,
    pub health: Arc<HealthTracker>,
    pub rate_limiter: Arc<RateLimiter>,
    pub downloads: Arc<DownloadRegistry>,
    background: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Core {
    /// Build and start the core: reconcile the download registry, subscribe
    /// the session registry to pool evictions, and spawn the periodic sweeps.
    pub async fn init(config: Arc<Config>, engine: Arc<dyn Engine>) -> Result<Arc<Self>> {
        let pool = Arc::new(ContextPool::new(engine, Arc::clone(&config)));
        let sessions = SessionRegistry::new(Arc::clone(&pool), Arc::clone(&config));
        let downloads = DownloadRegistry::init(Arc::clone(&config)).await?;
        let health = Arc::new(HealthTracker::new(config.failure_threshold));
        let rate_limiter = Arc::new(RateLimiter::new());

        let core = Arc::new(Self {
            limiter: UserLimiter::new(
                config.max_concurrent_per_user,
                Duration::from_secs(30),
            ),
            tab_locks: Arc::new(TabLocks::new(config.tab_lock_timeout)),
            pool,
            sessions: Arc::clone(&sessions),
            downloads: Arc::clone(&downloads),
            health: Arc::clone(&health),
            rate_limiter: Arc::clone(&rate_limiter),
            config: Arc::clone(&config),
            background: StdMutex::new(Vec::new()),
        });

        let mut tasks = core.background.lock().expect("background tasks");
        tasks.push(rate_limiter.spawn_sweeper());
        tasks.push(downloads.spawn_ttl_sweeper());
        tasks.push(sessions.spawn_idle_reaper());
        tasks.push(health.spawn_probe(config.health_probe_interval));
        drop(tasks);

        info!(port = config.port, "core initialized");
        Ok(core)
    }

    /// Shut down: flag recovering (health answers 503), stop the sweeps,
    /// close everything, and flush the download registry.
    pub async fn shutdown(&self) {
        self.health.set_recovering(true);
        for task in self.background.lock().expect("background tasks").drain(..) {
            task.abort();
        }
        let orphans = self.sessions.close_all_sessions().await;
        for tab in orphans {
            self.tab_locks.clear(&tab.id);
            safe_page_close(Arc::clone(&tab.page)).await;
        }
        if let Err(e) = self.downloads.persist_now().await {
            warn!(error = %e, "final download registry flush failed");
        }
        info!("core shut down");
    }

    /// Run an operation under the handler deadline. On expiry the result is
    /// discarded and the caller gets a timeout error; the op may still
    /// settle in the background.
    pub async fn with_timeout<T>(
        &self,
        label: &str,
        budget: Duration,
        op: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(budget, op).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::timeout(format!(
                "{label} timed out after {}ms",
                budget.as_millis()
            ))),
        }
    }

    fn handler_budget(&self) -> Duration {
        self.config.handler_timeout
    }

    async fn find_tab(&self, user_id: &str, tab_id: &str) -> Result<Arc<Tab>> {
        self.sessions
            .find_tab(tab_id, user_id)
            .await
            .map(|(_, tab)| tab)
            .ok_or_else(|| CoreError::not_found("Tab not found"))
    }

    // ── Tab lifecycle ────────────────────────────────────────────────────────

    pub async fn create_tab(
        &self,
        user_id: &str,
        group: &str,
        seed: Option<SeedOptions>,
    ) -> Result<Value> {
        let _op = self.health.begin_op();
        let budget = self.handler_budget();
        self.with_timeout("create tab", budget, async {
            let _permit = self.limiter.acquire(user_id).await?;
            let (_, tab) = self.sessions.create_tab(user_id, group, seed.as_ref()).await?;
            tab.page
                .set_download_handler(self.downloads.handler_for(user_id, &tab.id));
            Ok(json!({ "tabId": tab.id, "sessionKey": group }))
        })
        .await
    }

    pub async fn list_tabs(&self, user_id: &str) -> Result<Value> {
        let tabs = self.sessions.list_tabs(user_id).await;
        let mut out = Vec::with_capacity(tabs.len());
        for (group, tab) in tabs {
            let url = tab.page.current_url().await.unwrap_or_default();
            out.push(json!({
                "tabId": tab.id,
                "sessionKey": group,
                "url": url,
            }));
        }
        Ok(json!({ "tabs": out }))
    }

    pub async fn close_tab(&self, user_id: &str, tab_id: &str) -> Result<Value> {
        let tab = self
            .sessions
            .remove_tab(tab_id, user_id)
            .await
            .ok_or_else(|| CoreError::not_found("Tab not found"))?;
        self.tab_locks.clear(tab_id);
        safe_page_close(Arc::clone(&tab.page)).await;
        Ok(json!({ "ok": true }))
    }

    pub async fn close_group(&self, user_id: &str, group: &str) -> Result<Value> {
        let tabs = self.sessions.remove_group(user_id, group).await;
        let closed = tabs.len();
        for tab in tabs {
            self.tab_locks.clear(&tab.id);
            safe_page_close(Arc::clone(&tab.page)).await;
        }
        Ok(json!({ "ok": true, "closed": closed }))
    }

    pub async fn close_user_sessions(&self, user_id: &str) -> Result<Value> {
        let tabs = self.sessions.close_sessions_for_user(user_id).await;
        for tab in &tabs {
            self.tab_locks.clear(&tab.id);
        }
        for tab in tabs {
            safe_page_close(Arc::clone(&tab.page)).await;
        }
        self.downloads.cleanup_expired();
        Ok(json!({ "ok": true }))
    }

    // ── Navigation, snapshot, actions ────────────────────────────────────────

    pub async fn navigate(&self, user_id: &str, tab_id: &str, url: &str) -> Result<Value> {
        let _op = self.health.begin_op();
        let budget = self.handler_budget();
        let result = self
            .with_timeout("navigate", budget, async {
                let tab = self.find_tab(user_id, tab_id).await?;
                let _permit = self.limiter.acquire(user_id).await?;
                self.tab_locks
                    .with_lock(tab_id, actions::navigate(&tab, &self.config, url))
                    .await
            })
            .await;

        // Only navigations feed the health counter; validation errors are
        // the caller's fault, not the browser's.
        match &result {
            Ok(_) => self.health.record_nav_success(),
            Err(CoreError::Engine(_) | CoreError::Timeout(_)) => {
                if self.health.record_nav_failure() {
                    warn!(
                        failures = self.health.consecutive_failures(),
                        "navigation failure threshold reached"
                    );
                }
            }
            Err(_) => {}
        }
        result
    }

    pub async fn snapshot(&self, user_id: &str, tab_id: &str, offset: usize) -> Result<Value> {
        let _op = self.health.begin_op();
        let budget = self.handler_budget();
        self.with_timeout("snapshot", budget, async {
            let tab = self.find_tab(user_id, tab_id).await?;
            let _permit = self.limiter.acquire(user_id).await?;
            self.tab_locks
                .with_lock(tab_id, async {
                    // Paginating reads reuse the cached snapshot so offsets
                    // stay stable; a fresh window starts with a rebuild.
                    let cached = tab.last_snapshot.lock().expect("snapshot lock").clone();
                    let annotated = match (offset > 0, cached) {
                        (true, Some(text)) => text,
                        _ => {
                            actions::rebuild_refs(&tab, &self.config).await;
                            tab.last_snapshot
                                .lock()
                                .expect("snapshot lock")
                                .clone()
                                .unwrap_or_default()
                        }
                    };

                    let refs_count = tab.refs.lock().expect("refs lock").len();
                    let url = tab.page.current_url().await.unwrap_or_default();
                    let view = snapshot::window(
                        &annotated,
                        offset,
                        self.config.max_snapshot_chars,
                        self.config.snapshot_tail_chars,
                    );
                    Ok(json!({
                        "ok": true,
                        "url": url,
                        "snapshot": view.text,
                        "refsCount": refs_count,
                        "truncated": view.truncated,
                        "totalChars": view.total_chars,
                        "offset": view.offset,
                        "hasMore": view.has_more,
                        "nextOffset": view.next_offset,
                    }))
                })
                .await
        })
        .await
    }

    pub async fn act(&self, user_id: &str, tab_id: &str, action: Action) -> Result<Value> {
        let _op = self.health.begin_op();
        let budget = self.handler_budget();
        self.with_timeout(&action.to_string(), budget, async {
            let tab = self.find_tab(user_id, tab_id).await?;
            let _permit = self.limiter.acquire(user_id).await?;
            self.tab_locks
                .with_lock(
                    tab_id,
                    actions::execute(&tab, &self.config, &self.downloads, action),
                )
                .await
        })
        .await
    }

    /// Shared evaluate path. `extended` raises the budget and is rate
    /// limited per user.
    pub async fn evaluate(
        &self,
        user_id: &str,
        tab_id: &str,
        expression: &str,
        timeout: Option<Duration>,
        extended: bool,
    ) -> Result<Value> {
        if extended {
            let decision = self.rate_limiter.check(
                user_id,
                self.config.eval_extended_rate_limit_max,
                self.config.eval_extended_rate_limit_window,
            );
            if !decision.allowed {
                return Err(CoreError::rate_limited(
                    decision.retry_after.unwrap_or_default(),
                ));
            }
        }

        let max_timeout = if extended {
            EVAL_EXTENDED_TIMEOUT
        } else {
            self.handler_budget()
        };
        // The handler budget must outlast the evaluation race itself.
        let budget = max_timeout + Duration::from_secs(5);

        let _op = self.health.begin_op();
        self.with_timeout("evaluate", budget, async {
            let tab = self.find_tab(user_id, tab_id).await?;
            let _permit = self.limiter.acquire(user_id).await?;
            self.tab_locks
                .with_lock(tab_id, async {
                    tab.record_tool_call();
                    actions::evaluate(&tab.page, expression, timeout, max_timeout).await
                })
                .await
        })
        .await
    }

    // ── Read-only tab surfaces ───────────────────────────────────────────────

    pub async fn links(&self, user_id: &str, tab_id: &str) -> Result<Value> {
        let tab = self.find_tab(user_id, tab_id).await?;
        let links: Vec<Value> = tab
            .refs
            .lock()
            .expect("refs lock")
            .links()
            .into_iter()
            .map(|(ref_id, info)| json!({ "ref": ref_id, "name": info.name, "nth": info.nth }))
            .collect();
        Ok(json!({ "links": links }))
    }

    pub async fn screenshot(&self, user_id: &str, tab_id: &str, full_page: bool) -> Result<Vec<u8>> {
        let _op = self.health.begin_op();
        let budget = self.handler_budget();
        self.with_timeout("screenshot", budget, async {
            let tab = self.find_tab(user_id, tab_id).await?;
            let _permit = self.limiter.acquire(user_id).await?;
            self.tab_locks
                .with_lock(tab_id, async {
                    tab.page
                        .screenshot(full_page)
                        .await
                        .map_err(|e| CoreError::engine(e.to_string()))
                })
                .await
        })
        .await
    }

    pub async fn stats(&self, user_id: &str, tab_id: &str) -> Result<TabStats> {
        let tab = self.find_tab(user_id, tab_id).await?;
        let url = tab.page.current_url().await.unwrap_or_default();
        Ok(TabStats {
            tab_id: tab.id.clone(),
            url,
            tool_calls: tab.tool_calls.load(std::sync::atomic::Ordering::SeqCst),
            visited_urls: tab.visited.lock().expect("visited lock").clone(),
            refs_count: tab.refs.lock().expect("refs lock").len(),
        })
    }

    // ── Cookies & display ────────────────────────────────────────────────────

    pub async fn cookies(&self, user_id: &str, tab_id: &str) -> Result<Vec<Cookie>> {
        let _tab = self.find_tab(user_id, tab_id).await?;
        let session = self.sessions.get_session(user_id, None).await?;
        session
            .context()
            .cookies()
            .await
            .map_err(|e| CoreError::engine(e.to_string()))
    }

    pub async fn import_cookies(&self, user_id: &str, cookies: Vec<Cookie>) -> Result<Value> {
        for cookie in &cookies {
            if cookie.name.is_empty() {
                return Err(CoreError::validation("cookie with empty name"));
            }
        }
        let count = cookies.len();
        let session = self.sessions.get_session(user_id, None).await?;
        session
            .context()
            .set_cookies(cookies)
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;
        Ok(json!({ "ok": true, "imported": count }))
    }

    /// Flip the user's display mode and restart their context. Tabs die with
    /// the old context; the profile persists.
    pub async fn toggle_display(&self, user_id: &str) -> Result<Value> {
        let mode = self.pool.current_display_mode(user_id).toggled();
        let tabs = self.sessions.close_sessions_for_user(user_id).await;
        for tab in tabs {
            self.tab_locks.clear(&tab.id);
            safe_page_close(Arc::clone(&tab.page)).await;
        }
        self.pool.restart_context(user_id, Some(mode)).await?;
        Ok(json!({ "ok": true, "headless": mode }))
    }

    // ── Resources & downloads ────────────────────────────────────────────────

    pub async fn extract_resources(
        &self,
        user_id: &str,
        tab_id: &str,
        opts: ExtractOptions,
    ) -> Result<Value> {
        let _op = self.health.begin_op();
        let budget = self.handler_budget();
        self.with_timeout("extract resources", budget, async {
            let tab = self.find_tab(user_id, tab_id).await?;
            let _permit = self.limiter.acquire(user_id).await?;
            self.tab_locks
                .with_lock(tab_id, async {
                    let extracted = resources::extract_resources(&tab.page, &opts).await?;
                    serde_json::to_value(extracted).map_err(|e| CoreError::engine(e.to_string()))
                })
                .await
        })
        .await
    }

    pub async fn batch_download(
        &self,
        user_id: &str,
        tab_id: &str,
        items: Vec<BatchItem>,
        opts: BatchOptions,
    ) -> Result<Value> {
        let _op = self.health.begin_op();
        // Batches run long; give them the extended budget.
        self.with_timeout("batch download", EVAL_EXTENDED_TIMEOUT, async {
            let tab = self.find_tab(user_id, tab_id).await?;
            let _permit = self.limiter.acquire(user_id).await?;
            let session = self.sessions.get_session(user_id, None).await?;
            let outcomes = resources::batch_download(
                &self.config,
                &self.downloads,
                &session.context(),
                &tab.page,
                user_id,
                &tab.id,
                items,
                &opts,
            )
            .await;
            Ok(json!({ "results": outcomes }))
        })
        .await
    }

    pub async fn resolve_blobs(
        &self,
        user_id: &str,
        tab_id: &str,
        urls: Vec<String>,
    ) -> Result<Value> {
        let _op = self.health.begin_op();
        let budget = self.handler_budget();
        self.with_timeout("resolve blobs", budget, async {
            let tab = self.find_tab(user_id, tab_id).await?;
            let _permit = self.limiter.acquire(user_id).await?;
            self.tab_locks
                .with_lock(tab_id, async {
                    let resolved = resources::resolve_blobs(&tab.page, &urls).await?;
                    let body: serde_json::Map<String, Value> = resolved
                        .into_iter()
                        .map(|(url, entry)| {
                            let value = match entry {
                                Some((data_url, mime)) => {
                                    json!({ "base64": data_url, "mimeType": mime })
                                }
                                None => Value::Null,
                            };
                            (url, value)
                        })
                        .collect();
                    Ok(Value::Object(body))
                })
                .await
        })
        .await
    }

    // ── Health ───────────────────────────────────────────────────────────────

    pub async fn health_payload(&self) -> Value {
        let pool_size = self.pool.size().await;
        let profile_dirs = std::fs::read_dir(&self.config.profiles_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0);
        json!({
            "ok": !self.health.is_recovering(),
            "running": true,
            "engine": "cdp",
            "browserConnected": pool_size > 0,
            "consecutiveFailures": self.health.consecutive_failures(),
            "activeOps": self.health.active_ops(),
            "poolSize": pool_size,
            "activeUserIds": self.pool.user_ids().await,
            "profileDirsTotal": profile_dirs,
        })
    }
}
