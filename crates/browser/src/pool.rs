//! Bounded LRU pool of persistent browser contexts, keyed by user.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use {
    futures::{FutureExt, future::Shared},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use {
    camofox_common::{CoreError, Result},
    camofox_config::{Config, HeadlessMode},
    camofox_engine::{Engine, EngineContext, LaunchOptions, SeedOptions},
};

/// How long a context close may take before we stop waiting for it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type LaunchFuture =
    Shared<futures::future::BoxFuture<'static, std::result::Result<Arc<dyn EngineContext>, String>>>;

/// A live pool entry.
pub struct ContextEntry {
    pub context: Arc<dyn EngineContext>,
    pub user_id: String,
    pub last_access: Instant,
    /// What the context was actually seeded with at launch.
    pub seed: SeedOptions,
    pub headless: HeadlessMode,
}

enum PoolSlot {
    Ready(ContextEntry),
    Launching(LaunchFuture),
}

/// Notified (with the user id) right before an evicted context is closed.
pub type EvictionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Bounded LRU of persistent contexts with single-flight launches.
///
/// One entry per user; the profile directory on disk outlives the entry, so
/// eviction only costs warm state, never user data.
pub struct ContextPool {
    engine: Arc<dyn Engine>,
    config: Arc<Config>,
    slots: Mutex<HashMap<String, PoolSlot>>,
    /// Per-user display-mode override set by toggle-display; survives
    /// relaunches within this process.
    display_modes: StdMutex<HashMap<String, HeadlessMode>>,
    eviction_callbacks: StdMutex<Vec<EvictionCallback>>,
}

impl ContextPool {
    pub fn new(engine: Arc<dyn Engine>, config: Arc<Config>) -> Self {
        Self {
            engine,
            config,
            slots: Mutex::new(HashMap::new()),
            display_modes: StdMutex::new(HashMap::new()),
            eviction_callbacks: StdMutex::new(Vec::new()),
        }
    }

    /// Register a callback fired before an evicted or closed context shuts
    /// down, so subscribers can drop their references first.
    pub fn on_evict(&self, callback: EvictionCallback) {
        self.eviction_callbacks
            .lock()
            .expect("eviction callbacks")
            .push(callback);
    }

    /// Get the user's context, launching it if needed.
    ///
    /// Seed options are honored on first launch only: a live context keeps
    /// what it was launched with, and differing seeds are ignored with a
    /// warning — persistence wins over fresh configuration.
    pub async fn ensure_context(
        &self,
        user_id: &str,
        seed: Option<&SeedOptions>,
    ) -> Result<Arc<dyn EngineContext>> {
        let pending = {
            let mut slots = self.slots.lock().await;

            let externally_closed = matches!(
                slots.get(user_id),
                Some(PoolSlot::Ready(entry)) if entry.context.is_closed()
            );
            if externally_closed {
                debug!(user_id, "pooled context was closed externally, relaunching");
                slots.remove(user_id);
            }

            match slots.get_mut(user_id) {
                Some(PoolSlot::Ready(entry)) => {
                    if let Some(seed) = seed
                        && !seed.is_empty()
                        && *seed != entry.seed
                    {
                        warn!(
                            user_id,
                            ?seed,
                            "ignoring seed options for already-launched context"
                        );
                    }
                    entry.last_access = Instant::now();
                    return Ok(Arc::clone(&entry.context));
                }
                Some(PoolSlot::Launching(future)) => Some(future.clone()),
                None => None,
            }
        };

        if let Some(future) = pending {
            // Single-flight: share the in-progress launch.
            return future.await.map_err(CoreError::engine);
        }

        self.launch(user_id, seed.cloned().unwrap_or_default()).await
    }

    async fn launch(&self, user_id: &str, seed: SeedOptions) -> Result<Arc<dyn EngineContext>> {
        let headless = self.display_mode(user_id);
        let opts = self.launch_options(user_id, seed.clone(), headless);
        let profile_dir = self.config.user_profile_dir(user_id);

        let engine = Arc::clone(&self.engine);
        let future: LaunchFuture = async move {
            engine
                .launch_persistent(&profile_dir, opts)
                .await
                .map_err(|e| e.to_string())
        }
        .boxed()
        .shared();

        {
            let mut slots = self.slots.lock().await;
            // Another caller may have installed a slot while we built the
            // future; defer to it.
            if slots.contains_key(user_id) {
                drop(slots);
                return Box::pin(self.ensure_context(user_id, None)).await;
            }
            slots.insert(user_id.to_string(), PoolSlot::Launching(future.clone()));
        }

        let launched = future.await;

        let mut slots = self.slots.lock().await;
        match launched {
            Ok(context) => {
                slots.insert(
                    user_id.to_string(),
                    PoolSlot::Ready(ContextEntry {
                        context: Arc::clone(&context),
                        user_id: user_id.to_string(),
                        last_access: Instant::now(),
                        seed,
                        headless,
                    }),
                );
                info!(user_id, "launched persistent context");
                self.evict_over_capacity(&mut slots).await;
                Ok(context)
            }
            Err(message) => {
                slots.remove(user_id);
                Err(CoreError::engine(message))
            }
        }
    }

    /// Evict least-recently-used ready entries until within capacity.
    /// Launching placeholders are never evicted.
    async fn evict_over_capacity(&self, slots: &mut HashMap<String, PoolSlot>) {
        while slots.len() > self.config.max_contexts {
            let lru = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    PoolSlot::Ready(entry) => Some((key.clone(), entry.last_access)),
                    PoolSlot::Launching(_) => None,
                })
                .min_by_key(|(_, last_access)| *last_access)
                .map(|(key, _)| key);

            let Some(key) = lru else { break };
            if let Some(PoolSlot::Ready(entry)) = slots.remove(&key) {
                info!(user_id = key, "evicting least-recently-used context");
                self.fire_eviction(&key);
                close_quietly(entry.context).await;
            }
        }
    }

    fn fire_eviction(&self, user_id: &str) {
        let callbacks = self
            .eviction_callbacks
            .lock()
            .expect("eviction callbacks")
            .clone();
        for callback in callbacks {
            callback(user_id);
        }
    }

    /// Close and relaunch the user's context, optionally switching display
    /// mode. Any pending launch is awaited first.
    pub async fn restart_context(
        &self,
        user_id: &str,
        headless: Option<HeadlessMode>,
    ) -> Result<Arc<dyn EngineContext>> {
        self.await_pending(user_id).await;

        if let Some(mode) = headless {
            self.display_modes
                .lock()
                .expect("display modes")
                .insert(user_id.to_string(), mode);
        }

        let seed = {
            let mut slots = self.slots.lock().await;
            match slots.remove(user_id) {
                Some(PoolSlot::Ready(entry)) => {
                    let seed = entry.seed.clone();
                    close_quietly(entry.context).await;
                    Some(seed)
                }
                Some(PoolSlot::Launching(_)) | None => None,
            }
        };

        self.ensure_context(user_id, seed.as_ref()).await
    }

    /// Close the user's context and drop the entry. The profile directory is
    /// left on disk.
    pub async fn close_context(&self, user_id: &str) {
        self.await_pending(user_id).await;
        let entry = {
            let mut slots = self.slots.lock().await;
            match slots.remove(user_id) {
                Some(PoolSlot::Ready(entry)) => Some(entry),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            close_quietly(entry.context).await;
            debug!(user_id, "closed pooled context");
        }
    }

    /// Best-effort close of every pooled context.
    pub async fn close_all(&self) {
        let entries: Vec<ContextEntry> = {
            let mut slots = self.slots.lock().await;
            let keys: Vec<String> = slots.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| match slots.remove(&key) {
                    Some(PoolSlot::Ready(entry)) => Some(entry),
                    _ => None,
                })
                .collect()
        };
        for entry in entries {
            close_quietly(entry.context).await;
        }
        info!("context pool closed");
    }

    /// Await any in-flight launch for this user, ignoring its outcome.
    async fn await_pending(&self, user_id: &str) {
        let pending = {
            let slots = self.slots.lock().await;
            match slots.get(user_id) {
                Some(PoolSlot::Launching(future)) => Some(future.clone()),
                _ => None,
            }
        };
        if let Some(future) = pending {
            let _ = future.await;
        }
    }

    fn display_mode(&self, user_id: &str) -> HeadlessMode {
        self.display_modes
            .lock()
            .expect("display modes")
            .get(user_id)
            .copied()
            .unwrap_or(self.config.headless)
    }

    /// The headless mode the user's next/current context runs with.
    pub fn current_display_mode(&self, user_id: &str) -> HeadlessMode {
        self.display_mode(user_id)
    }

    fn launch_options(
        &self,
        user_id: &str,
        seed: SeedOptions,
        headless: HeadlessMode,
    ) -> LaunchOptions {
        LaunchOptions {
            headless: headless != HeadlessMode::Headed,
            virtual_display: headless == HeadlessMode::Virtual,
            proxy: self.config.proxy.as_ref().map(|p| {
                camofox_engine::types::ProxySettings {
                    host: p.host.clone(),
                    port: p.port,
                    username: p.username.clone(),
                    password: p.password.clone(),
                }
            }),
            seed,
            downloads_dir: Some(
                self.config
                    .downloads_dir
                    .join(".spool")
                    .join(urlencoding::encode(user_id).into_owned()),
            ),
        }
    }

    pub async fn size(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn user_ids(&self) -> Vec<String> {
        self.slots.lock().await.keys().cloned().collect()
    }
}

/// Close a context, bounded and without propagating errors.
async fn close_quietly(context: Arc<dyn EngineContext>) {
    match tokio::time::timeout(CLOSE_TIMEOUT, context.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "context close failed"),
        Err(_) => warn!("context close timed out"),
    }
}
