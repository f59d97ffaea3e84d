//! Sessions, tab groups, tabs, and the tab reverse index.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    futures::{FutureExt, future::Shared},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use {
    camofox_common::{CoreError, Result},
    camofox_config::Config,
    camofox_engine::{EngineContext, EnginePage, SeedOptions},
};

use crate::{pool::ContextPool, snapshot::RefTable};

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// One live tab: an engine page plus the orchestrator state riding on it.
pub struct Tab {
    pub id: String,
    pub page: Arc<dyn EnginePage>,
    pub refs: StdMutex<RefTable>,
    pub visited: StdMutex<Vec<String>>,
    pub tool_calls: AtomicU64,
    pub last_snapshot: StdMutex<Option<String>>,
}

impl Tab {
    fn new(page: Arc<dyn EnginePage>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            page,
            refs: StdMutex::new(RefTable::new()),
            visited: StdMutex::new(Vec::new()),
            tool_calls: AtomicU64::new(0),
            last_snapshot: StdMutex::new(None),
        })
    }

    pub fn record_tool_call(&self) -> u64 {
        self.tool_calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_visit(&self, url: &str) {
        let mut visited = self.visited.lock().expect("visited lock");
        if visited.last().map(String::as_str) != Some(url) {
            visited.push(url.to_string());
        }
    }

    /// Drop refs and the cached snapshot in one step, before a rebuild.
    pub fn invalidate_refs(&self) {
        self.refs.lock().expect("refs lock").clear();
        *self.last_snapshot.lock().expect("snapshot lock") = None;
    }
}

/// Per-user bundle of a browser context and its tab groups.
pub struct Session {
    pub key: String,
    pub user_id: String,
    context: StdMutex<Arc<dyn EngineContext>>,
    /// group name → tab id → tab.
    groups: StdMutex<HashMap<String, HashMap<String, Arc<Tab>>>>,
    last_access: StdMutex<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn context(&self) -> Arc<dyn EngineContext> {
        Arc::clone(&self.context.lock().expect("session context"))
    }

    fn refresh_context(&self, context: Arc<dyn EngineContext>) {
        *self.context.lock().expect("session context") = context;
    }

    pub fn touch(&self) {
        *self.last_access.lock().expect("session access") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().expect("session access").elapsed()
    }

    fn insert_tab(&self, group: &str, tab: Arc<Tab>) {
        self.groups
            .lock()
            .expect("session groups")
            .entry(group.to_string())
            .or_default()
            .insert(tab.id.clone(), tab);
    }

    fn get_tab(&self, tab_id: &str) -> Option<Arc<Tab>> {
        self.groups
            .lock()
            .expect("session groups")
            .values()
            .find_map(|tabs| tabs.get(tab_id).cloned())
    }

    /// Remove a tab; empty groups are deleted with their last tab.
    fn remove_tab(&self, tab_id: &str) -> Option<Arc<Tab>> {
        let mut groups = self.groups.lock().expect("session groups");
        let mut removed = None;
        groups.retain(|_, tabs| {
            if removed.is_none()
                && let Some(tab) = tabs.remove(tab_id)
            {
                removed = Some(tab);
            }
            !tabs.is_empty()
        });
        removed
    }

    fn remove_group(&self, group: &str) -> Vec<Arc<Tab>> {
        self.groups
            .lock()
            .expect("session groups")
            .remove(group)
            .map(|tabs| tabs.into_values().collect())
            .unwrap_or_default()
    }

    pub fn all_tabs(&self) -> Vec<(String, Arc<Tab>)> {
        self.groups
            .lock()
            .expect("session groups")
            .iter()
            .flat_map(|(group, tabs)| {
                tabs.values()
                    .map(|tab| (group.clone(), Arc::clone(tab)))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

type SessionFuture = Shared<futures::future::BoxFuture<'static, std::result::Result<(), String>>>;

struct RegistryInner {
    sessions: HashMap<String, Arc<Session>>,
    launching: HashMap<String, SessionFuture>,
}

/// Maps session keys to sessions and owns the tab reverse index.
pub struct SessionRegistry {
    pool: Arc<ContextPool>,
    config: Arc<Config>,
    inner: Mutex<RegistryInner>,
    /// tab id → session key. A back-reference, not an ownership path; kept
    /// in sync by the create/destroy paths.
    tab_index: StdMutex<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<ContextPool>, config: Arc<Config>) -> Arc<Self> {
        let registry = Arc::new(Self {
            pool,
            config,
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                launching: HashMap::new(),
            }),
            tab_index: StdMutex::new(HashMap::new()),
        });
        registry.subscribe_pool_evictions();
        registry
    }

    /// Session bucket key for a user. Legacy callers append a hashed-options
    /// suffix after `::`; it collapses to the same per-user entry.
    fn session_key(user_id: &str) -> String {
        match user_id.split_once("::") {
            Some((base, _)) => base.to_string(),
            None => user_id.to_string(),
        }
    }

    /// Get or create the user's session. Creation is single-flight: callers
    /// landing during a launch share the same future.
    pub async fn get_session(
        &self,
        user_id: &str,
        seed: Option<&SeedOptions>,
    ) -> Result<Arc<Session>> {
        let key = Self::session_key(user_id);

        let pending = {
            let inner = self.inner.lock().await;
            if let Some(session) = inner.sessions.get(&key) {
                let session = Arc::clone(session);
                drop(inner);
                // Refresh from the pool: the context may have been
                // relaunched after an external close.
                let context = self.pool.ensure_context(&key, seed).await?;
                session.refresh_context(context);
                session.touch();
                return Ok(session);
            }
            if let Some(future) = inner.launching.get(&key) {
                Some(future.clone())
            } else {
                if inner.sessions.len() + inner.launching.len() >= self.config.max_sessions {
                    return Err(CoreError::busy("session limit reached"));
                }
                None
            }
        };

        if let Some(future) = pending {
            future.await.map_err(CoreError::engine)?;
            return Box::pin(self.get_session(user_id, seed)).await;
        }

        self.create_session(&key, seed).await
    }

    async fn create_session(&self, key: &str, seed: Option<&SeedOptions>) -> Result<Arc<Session>> {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<std::result::Result<(), String>>();
        let placeholder: SessionFuture = done_rx
            .map(|r| r.unwrap_or_else(|_| Err("session launch abandoned".to_string())))
            .boxed()
            .shared();

        {
            let mut inner = self.inner.lock().await;
            if inner.sessions.contains_key(key) || inner.launching.contains_key(key) {
                // Raced with another creator; retry through the front door.
                drop(inner);
                return Box::pin(self.get_session(key, seed)).await;
            }
            inner
                .launching
                .insert(key.to_string(), placeholder.clone());
        }

        let launched = self.pool.ensure_context(key, seed).await;

        let mut inner = self.inner.lock().await;
        inner.launching.remove(key);
        match launched {
            Ok(context) => {
                let session = Arc::new(Session {
                    key: key.to_string(),
                    user_id: key.to_string(),
                    context: StdMutex::new(context),
                    groups: StdMutex::new(HashMap::new()),
                    last_access: StdMutex::new(Instant::now()),
                });
                inner.sessions.insert(key.to_string(), Arc::clone(&session));
                let _ = done_tx.send(Ok(()));
                info!(session_key = key, "created session");
                Ok(session)
            }
            Err(e) => {
                let _ = done_tx.send(Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Create a tab in `group` within the user's session.
    pub async fn create_tab(
        &self,
        user_id: &str,
        group: &str,
        seed: Option<&SeedOptions>,
    ) -> Result<(Arc<Session>, Arc<Tab>)> {
        let session = self.get_session(user_id, seed).await?;
        let page = session
            .context()
            .new_page()
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;
        let tab = Tab::new(page);
        session.insert_tab(group, Arc::clone(&tab));
        self.tab_index
            .lock()
            .expect("tab index")
            .insert(tab.id.clone(), session.key.clone());
        debug!(tab_id = tab.id, group, user_id, "created tab");
        Ok((session, tab))
    }

    /// Find a tab by id, verifying the caller owns it.
    ///
    /// The reverse index is the fast path; on a miss (or a stale entry
    /// pointing at another user) the user's own sessions are scanned and the
    /// index repopulated. Tabs of other users are never returned.
    pub async fn find_tab(&self, tab_id: &str, user_id: &str) -> Option<(Arc<Session>, Arc<Tab>)> {
        let key = Self::session_key(user_id);

        let indexed_key = self
            .tab_index
            .lock()
            .expect("tab index")
            .get(tab_id)
            .cloned();

        let inner = self.inner.lock().await;

        if let Some(indexed) = indexed_key
            && indexed == key
            && let Some(session) = inner.sessions.get(&indexed)
            && let Some(tab) = session.get_tab(tab_id)
        {
            session.touch();
            return Some((Arc::clone(session), tab));
        }

        // Scan only this user's sessions; a hit repopulates the index.
        for (session_key, session) in inner.sessions.iter() {
            if session.user_id != key {
                continue;
            }
            if let Some(tab) = session.get_tab(tab_id) {
                self.tab_index
                    .lock()
                    .expect("tab index")
                    .insert(tab_id.to_string(), session_key.clone());
                session.touch();
                return Some((Arc::clone(session), tab));
            }
        }
        None
    }

    /// Remove a tab from its session and the reverse index atomically.
    /// Returns the tab for the caller to close.
    pub async fn remove_tab(&self, tab_id: &str, user_id: &str) -> Option<Arc<Tab>> {
        let (session, _) = self.find_tab(tab_id, user_id).await?;
        let removed = session.remove_tab(tab_id);
        if removed.is_some() {
            self.tab_index.lock().expect("tab index").remove(tab_id);
        }
        removed
    }

    /// Remove a whole tab group; returns its tabs for closing.
    pub async fn remove_group(&self, user_id: &str, group: &str) -> Vec<Arc<Tab>> {
        let key = Self::session_key(user_id);
        let inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get(&key) else {
            return Vec::new();
        };
        let tabs = session.remove_group(group);
        let mut index = self.tab_index.lock().expect("tab index");
        for tab in &tabs {
            index.remove(&tab.id);
        }
        tabs
    }

    pub async fn list_tabs(&self, user_id: &str) -> Vec<(String, Arc<Tab>)> {
        let key = Self::session_key(user_id);
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(&key)
            .map(|session| session.all_tabs())
            .unwrap_or_default()
    }

    /// Close the user's pool context and drop all their sessions. Persistent
    /// profiles stay on disk.
    pub async fn close_sessions_for_user(&self, user_id: &str) -> Vec<Arc<Tab>> {
        let key = Self::session_key(user_id);
        self.pool.close_context(&key).await;
        self.drop_sessions_where(|session| session.user_id == key)
            .await
    }

    pub async fn close_all_sessions(&self) -> Vec<Arc<Tab>> {
        self.pool.close_all().await;
        self.drop_sessions_where(|_| true).await
    }

    async fn drop_sessions_where(
        &self,
        predicate: impl Fn(&Session) -> bool,
    ) -> Vec<Arc<Tab>> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, session)| predicate(session))
            .map(|(key, _)| key.clone())
            .collect();

        let mut orphans = Vec::new();
        let mut index = self.tab_index.lock().expect("tab index");
        for key in doomed {
            if let Some(session) = inner.sessions.remove(&key) {
                for (_, tab) in session.all_tabs() {
                    index.remove(&tab.id);
                    orphans.push(tab);
                }
                debug!(session_key = key, "dropped session");
            }
        }
        orphans
    }

    /// Sessions idle past the configured timeout are evicted; their contexts
    /// are closed through the pool.
    pub async fn reap_idle(&self) -> Vec<Arc<Tab>> {
        let idle_timeout = self.config.session_idle_timeout;
        let stale: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .sessions
                .iter()
                .filter(|(_, session)| session.idle_for() > idle_timeout)
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut orphans = Vec::new();
        for key in stale {
            info!(session_key = key, "reaping idle session");
            self.pool.close_context(&key).await;
            orphans.extend(
                self.drop_sessions_where(|session| session.key == key)
                    .await,
            );
        }
        orphans
    }

    pub fn spawn_idle_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                for tab in registry.reap_idle().await {
                    crate::core::safe_page_close(Arc::clone(&tab.page)).await;
                }
            }
        })
    }

    /// When the pool evicts a context, the matching session entry goes too;
    /// the profile on disk is retained.
    fn subscribe_pool_evictions(self: &Arc<Self>) {
        let weak: Weak<SessionRegistry> = Arc::downgrade(self);
        self.pool.on_evict(Arc::new(move |user_id: &str| {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            let user_id = user_id.to_string();
            tokio::spawn(async move {
                let orphans = registry
                    .drop_sessions_where(|session| session.user_id == user_id)
                    .await;
                if !orphans.is_empty() {
                    warn!(
                        user_id,
                        tabs = orphans.len(),
                        "pool eviction dropped a session with live tabs"
                    );
                }
                for tab in orphans {
                    crate::core::safe_page_close(Arc::clone(&tab.page)).await;
                }
            });
        }));
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use camofox_engine::fake::FakeEngine;

    use super::*;

    fn setup() -> (tempfile::TempDir, FakeEngine, Arc<SessionRegistry>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            profiles_dir: tmp.path().join("profiles"),
            downloads_dir: tmp.path().join("downloads"),
            ..Config::default()
        });
        let engine = FakeEngine::new();
        let pool = Arc::new(ContextPool::new(
            Arc::new(engine.clone()),
            Arc::clone(&config),
        ));
        let registry = SessionRegistry::new(pool, config);
        (tmp, engine, registry)
    }

    #[tokio::test]
    async fn tab_lookup_respects_ownership() {
        let (_tmp, _engine, registry) = setup();
        let (_, tab) = registry.create_tab("u1", "main", None).await.unwrap();

        assert!(registry.find_tab(&tab.id, "u1").await.is_some());
        // Another user guessing the tab id gets nothing.
        assert!(registry.find_tab(&tab.id, "u2").await.is_none());
        assert!(registry.find_tab("no-such-tab", "u1").await.is_none());
    }

    #[tokio::test]
    async fn index_repopulates_after_manual_clear() {
        let (_tmp, _engine, registry) = setup();
        let (_, tab) = registry.create_tab("u1", "main", None).await.unwrap();

        registry.tab_index.lock().unwrap().clear();
        assert!(registry.find_tab(&tab.id, "u1").await.is_some());
        assert_eq!(
            registry.tab_index.lock().unwrap().get(&tab.id),
            Some(&"u1".to_string())
        );
    }

    #[tokio::test]
    async fn remove_tab_clears_index_and_empty_group() {
        let (_tmp, _engine, registry) = setup();
        let (session, tab) = registry.create_tab("u1", "main", None).await.unwrap();

        let removed = registry.remove_tab(&tab.id, "u1").await.unwrap();
        assert_eq!(removed.id, tab.id);
        assert!(registry.find_tab(&tab.id, "u1").await.is_none());
        assert!(session.groups.lock().unwrap().is_empty());
        assert!(!registry.tab_index.lock().unwrap().contains_key(&tab.id));
    }

    #[tokio::test]
    async fn legacy_session_keys_collapse_to_user() {
        let (_tmp, engine, registry) = setup();
        let a = registry.get_session("u1", None).await.unwrap();
        let b = registry.get_session("u1::abcdef", None).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(engine.launch_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_session_creation_is_single_flight() {
        let (_tmp, engine, registry) = setup();
        engine.set_launch_delay(Duration::from_millis(50));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_session("u1", None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(engine.launch_count(), 1);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn session_limit_rejects_new_users() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            profiles_dir: tmp.path().join("profiles"),
            downloads_dir: tmp.path().join("downloads"),
            max_sessions: 1,
            ..Config::default()
        });
        let engine = FakeEngine::new();
        let pool = Arc::new(ContextPool::new(
            Arc::new(engine.clone()),
            Arc::clone(&config),
        ));
        let registry = SessionRegistry::new(pool, config);

        registry.get_session("u1", None).await.unwrap();
        let err = registry.get_session("u2", None).await.unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));
        // The existing session is still reachable.
        registry.get_session("u1", None).await.unwrap();
    }

    #[tokio::test]
    async fn close_sessions_for_user_is_scoped() {
        let (_tmp, _engine, registry) = setup();
        let (_, tab1) = registry.create_tab("u1", "main", None).await.unwrap();
        let (_, tab2) = registry.create_tab("u2", "main", None).await.unwrap();

        let orphans = registry.close_sessions_for_user("u1").await;
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, tab1.id);

        assert!(registry.find_tab(&tab1.id, "u1").await.is_none());
        assert!(registry.find_tab(&tab2.id, "u2").await.is_some());
    }

    #[tokio::test]
    async fn remove_group_returns_only_that_group() {
        let (_tmp, _engine, registry) = setup();
        let (_, tab_a) = registry.create_tab("u1", "alpha", None).await.unwrap();
        let (_, _tab_b) = registry.create_tab("u1", "beta", None).await.unwrap();

        let removed = registry.remove_group("u1", "alpha").await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, tab_a.id);
        assert_eq!(registry.list_tabs("u1").await.len(), 1);
    }
}
