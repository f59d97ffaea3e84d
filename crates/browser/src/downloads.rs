//! Download registry: per-user quotas, TTL cleanup, crash-safe persistence.
//!
//! The in-memory map is authoritative at runtime; `registry.json` is
//! rewritten atomically on a debounced timer and is the recovery source at
//! startup.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use {
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use {
    camofox_common::{CoreError, Result, now_millis},
    camofox_config::Config,
    camofox_engine::{DownloadHandler, EngineDownload},
};

use crate::types::{DownloadInfo, DownloadStatus};

const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Replace path separators, strip NULs, trim, cap length. Empty names fall
/// back to `"download"`.
pub fn sanitize_filename(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c == '\\' || c == '/' { '_' } else { c })
        .filter(|c| *c != '\0')
        .collect();
    let trimmed = cleaned.trim();
    let capped: String = trimmed.chars().take(200).collect();
    if capped.is_empty() {
        "download".to_string()
    } else {
        capped
    }
}

/// Extension-keyed MIME lookup; multi-dot names use the last dot.
pub fn guess_mime(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "json" => "application/json",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Split a saved filename back into `(download id, suggested part)`.
/// Only `{uuid}_{rest}` names are recognized during reconciliation.
fn parse_saved_filename(name: &str) -> Option<(String, String)> {
    let (id, rest) = name.split_at_checked(36)?;
    let rest = rest.strip_prefix('_')?;
    uuid::Uuid::parse_str(id).ok()?;
    Some((id.to_string(), rest.to_string()))
}

/// In-memory download registry with a persisted JSON snapshot.
pub struct DownloadRegistry {
    config: Arc<Config>,
    entries: StdMutex<HashMap<String, DownloadInfo>>,
    save_tx: mpsc::UnboundedSender<()>,
}

impl DownloadRegistry {
    /// Load (and reconcile) the registry, then start the debounced persister.
    pub async fn init(config: Arc<Config>) -> Result<Arc<Self>> {
        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            config,
            entries: StdMutex::new(HashMap::new()),
            save_tx,
        });
        registry.reconcile().await?;
        registry.persist_now().await?;
        registry.spawn_persister(save_rx);
        Ok(registry)
    }

    fn registry_path(&self) -> PathBuf {
        self.config.downloads_dir.join("registry.json")
    }

    /// Absolute path of the file backing an entry.
    pub fn file_path(&self, info: &DownloadInfo) -> PathBuf {
        self.config
            .user_downloads_dir(&info.user_id)
            .join(&info.saved_filename)
    }

    // ── Engine-driven downloads ──────────────────────────────────────────────

    /// The handler to register on a tab's page: every engine download lands
    /// in the registry under that tab's owner.
    pub fn handler_for(self: &Arc<Self>, user_id: &str, tab_id: &str) -> DownloadHandler {
        let registry = Arc::clone(self);
        let user_id = user_id.to_string();
        let tab_id = tab_id.to_string();
        Arc::new(move |download| {
            registry.start_download(&user_id, &tab_id, download);
        })
    }

    /// Track an engine download to completion. Returns the entry id
    /// immediately; saving and finalization run in a spawned task.
    pub fn start_download(
        self: &Arc<Self>,
        user_id: &str,
        tab_id: &str,
        download: Arc<dyn EngineDownload>,
    ) -> String {
        let info = self.register(
            user_id,
            tab_id,
            &download.url(),
            &download.suggested_filename(),
        );
        let id = info.id.clone();
        let path = self.file_path(&info);
        let registry = Arc::clone(self);

        let task_id = id.clone();
        tokio::spawn(async move {
            let save_result = download.save_as(&path).await;
            let failure = match save_result {
                Ok(()) => download.failure().await,
                Err(e) => Some(e.to_string()),
            };
            registry.finalize(&task_id, failure).await;
        });

        id
    }

    /// Insert a `pending` entry, enforcing the per-user cap first.
    pub fn register(
        &self,
        user_id: &str,
        tab_id: &str,
        url: &str,
        suggested_filename: &str,
    ) -> DownloadInfo {
        self.evict_for_cap(user_id);

        let id = uuid::Uuid::new_v4().to_string();
        let suggested = sanitize_filename(suggested_filename);
        let saved_filename = format!("{id}_{suggested}");
        let info = DownloadInfo {
            id: id.clone(),
            user_id: user_id.to_string(),
            tab_id: tab_id.to_string(),
            url: url.to_string(),
            suggested_filename: suggested.clone(),
            saved_filename,
            mime_type: guess_mime(&suggested).to_string(),
            size: None,
            status: DownloadStatus::Pending,
            error: None,
            created_at: now_millis(),
            completed_at: None,
            content_url: format!("/downloads/{id}/content"),
        };

        self.entries
            .lock()
            .expect("download entries")
            .insert(id, info.clone());
        self.schedule_save();
        debug!(
            download_id = info.id,
            user_id, tab_id, "registered pending download"
        );
        info
    }

    /// At the cap, the oldest non-pending entry (by completion, falling back
    /// to creation time) is evicted and its file deleted. Pending entries
    /// are never evicted.
    fn evict_for_cap(&self, user_id: &str) {
        let victim = {
            let entries = self.entries.lock().expect("download entries");
            let user_entries: Vec<&DownloadInfo> = entries
                .values()
                .filter(|info| info.user_id == user_id)
                .collect();
            if user_entries.len() < self.config.max_downloads_per_user {
                return;
            }
            user_entries
                .iter()
                .filter(|info| info.status.is_terminal())
                .min_by_key(|info| info.age_key())
                .map(|info| (*info).clone())
        };

        let Some(victim) = victim else {
            warn!(user_id, "download cap reached with only pending entries");
            return;
        };

        let path = self.file_path(&victim);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to delete evicted download file");
        }
        self.entries
            .lock()
            .expect("download entries")
            .remove(&victim.id);
        info!(download_id = victim.id, user_id, "evicted download over per-user cap");
        self.schedule_save();
    }

    /// Transition a pending entry to its terminal state after the engine
    /// settles the download.
    pub async fn finalize(&self, id: &str, failure: Option<String>) {
        let info = {
            let entries = self.entries.lock().expect("download entries");
            entries.get(id).cloned()
        };
        let Some(info) = info else { return };
        let path = self.file_path(&info);

        let (status, error, size) = match failure {
            Some(message) => {
                let _ = tokio::fs::remove_file(&path).await;
                let status = if message.to_lowercase().contains("cancel") {
                    DownloadStatus::Canceled
                } else {
                    DownloadStatus::Failed
                };
                (status, Some(message), None)
            }
            None => match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() > self.config.max_download_size_bytes() => {
                    let _ = tokio::fs::remove_file(&path).await;
                    (
                        DownloadStatus::Failed,
                        Some(format!(
                            "file exceeds the {}MB download limit",
                            self.config.max_download_size_mb
                        )),
                        None,
                    )
                }
                Ok(meta) => (DownloadStatus::Completed, None, Some(meta.len())),
                Err(e) => (
                    DownloadStatus::Failed,
                    Some(format!("downloaded file missing: {e}")),
                    None,
                ),
            },
        };

        self.apply_terminal(id, status, error, size);
    }

    /// Record a terminal state for an entry (engine and batch paths share
    /// this transition).
    pub fn apply_terminal(
        &self,
        id: &str,
        status: DownloadStatus,
        error: Option<String>,
        size: Option<u64>,
    ) {
        let mut entries = self.entries.lock().expect("download entries");
        if let Some(info) = entries.get_mut(id) {
            info.status = status;
            info.error = error;
            info.size = size;
            info.completed_at = Some(now_millis());
        }
        drop(entries);
        self.schedule_save();
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn list_for_user(&self, user_id: &str) -> Vec<DownloadInfo> {
        let mut list: Vec<DownloadInfo> = self
            .entries
            .lock()
            .expect("download entries")
            .values()
            .filter(|info| info.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|info| std::cmp::Reverse(info.created_at));
        list
    }

    pub fn list_for_tab(&self, user_id: &str, tab_id: &str) -> Vec<DownloadInfo> {
        self.list_for_user(user_id)
            .into_iter()
            .filter(|info| info.tab_id == tab_id)
            .collect()
    }

    /// Entries this tab created within the trailing window. The click action
    /// uses this to inline downloads it just triggered.
    pub fn recent_for_tab(&self, tab_id: &str, window: Duration) -> Vec<DownloadInfo> {
        let cutoff = now_millis().saturating_sub(window.as_millis() as u64);
        let mut list: Vec<DownloadInfo> = self
            .entries
            .lock()
            .expect("download entries")
            .values()
            .filter(|info| info.tab_id == tab_id && info.created_at >= cutoff)
            .cloned()
            .collect();
        list.sort_by_key(|info| info.created_at);
        list
    }

    /// Ownership-checked lookup.
    pub fn get(&self, id: &str, user_id: &str) -> Result<DownloadInfo> {
        self.entries
            .lock()
            .expect("download entries")
            .get(id)
            .filter(|info| info.user_id == user_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("download not found"))
    }

    /// The on-disk path for a completed download's content.
    pub fn content_path(&self, id: &str, user_id: &str) -> Result<(DownloadInfo, PathBuf)> {
        let info = self.get(id, user_id)?;
        if info.status != DownloadStatus::Completed {
            return Err(CoreError::conflict(
                "download content is only available once completed",
            ));
        }
        let path = self.file_path(&info);
        Ok((info, path))
    }

    pub async fn delete(&self, id: &str, user_id: &str) -> Result<()> {
        let info = self.get(id, user_id)?;
        let _ = tokio::fs::remove_file(self.file_path(&info)).await;
        self.entries.lock().expect("download entries").remove(id);
        self.schedule_save();
        Ok(())
    }

    pub fn count_for_user(&self, user_id: &str) -> usize {
        self.entries
            .lock()
            .expect("download entries")
            .values()
            .filter(|info| info.user_id == user_id)
            .count()
    }

    // ── TTL cleanup ──────────────────────────────────────────────────────────

    /// Drop finished entries older than the TTL; pending entries are never
    /// touched.
    pub fn cleanup_expired(&self) {
        let cutoff = now_millis().saturating_sub(self.config.download_ttl.as_millis() as u64);
        let expired: Vec<DownloadInfo> = self
            .entries
            .lock()
            .expect("download entries")
            .values()
            .filter(|info| info.status.is_terminal() && info.created_at < cutoff)
            .cloned()
            .collect();

        if expired.is_empty() {
            return;
        }
        for info in &expired {
            let _ = std::fs::remove_file(self.file_path(info));
        }
        let mut entries = self.entries.lock().expect("download entries");
        for info in &expired {
            entries.remove(&info.id);
        }
        drop(entries);
        info!(removed = expired.len(), "expired downloads cleaned up");
        self.schedule_save();
    }

    pub fn spawn_ttl_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TTL_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.cleanup_expired();
            }
        })
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    fn schedule_save(&self) {
        let _ = self.save_tx.send(());
    }

    fn spawn_persister(self: &Arc<Self>, mut save_rx: mpsc::UnboundedReceiver<()>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while save_rx.recv().await.is_some() {
                tokio::time::sleep(PERSIST_DEBOUNCE).await;
                // Collapse every signal that arrived during the debounce.
                while save_rx.try_recv().is_ok() {}
                if let Err(e) = registry.persist_now().await {
                    warn!(error = %e, "failed to persist download registry");
                }
            }
        });
    }

    /// Write the registry snapshot atomically: temp file, then rename.
    pub async fn persist_now(&self) -> Result<()> {
        let snapshot = self.entries.lock().expect("download entries").clone();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| CoreError::engine(format!("registry serialization failed: {e}")))?;

        let path = self.registry_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    // ── Startup reconciliation ───────────────────────────────────────────────

    /// Rebuild state from disk: load the registry file, drop entries whose
    /// files vanished, finalize entries that were pending at crash time, and
    /// adopt orphan files found in user directories.
    async fn reconcile(&self) -> Result<()> {
        let mut loaded: HashMap<String, DownloadInfo> = HashMap::new();
        let path = self.registry_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, DownloadInfo>>(&raw) {
                Ok(entries) => loaded = entries,
                Err(e) => warn!(error = %e, "registry file unparseable, starting fresh"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut kept: HashMap<String, DownloadInfo> = HashMap::new();
        let mut dropped = 0usize;
        for (id, mut info) in loaded {
            let file = self.file_path(&info);
            match tokio::fs::metadata(&file).await {
                Ok(meta) => {
                    if info.status == DownloadStatus::Pending {
                        // The process died mid-save but the file is whole.
                        info.status = DownloadStatus::Completed;
                        info.size = Some(meta.len());
                        info.completed_at = Some(now_millis());
                    }
                    kept.insert(id, info);
                }
                Err(_) => dropped += 1,
            }
        }

        let adopted = self.adopt_orphans(&mut kept).await?;
        if dropped > 0 || adopted > 0 {
            info!(kept = kept.len(), dropped, adopted, "download registry reconciled");
        }

        *self.entries.lock().expect("download entries") = kept;
        Ok(())
    }

    /// Files matching `{uuid}_{rest}` with no registry entry become
    /// `completed` entries attributed to an unknown tab.
    async fn adopt_orphans(&self, kept: &mut HashMap<String, DownloadInfo>) -> Result<usize> {
        let mut adopted = 0usize;
        let mut root = match tokio::fs::read_dir(&self.config.downloads_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(user_dir) = root.next_entry().await? {
            if !user_dir.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = user_dir.file_name().to_string_lossy().to_string();
            if dir_name == ".spool" {
                continue;
            }
            let user_id = urlencoding::decode(&dir_name)
                .map(|s| s.into_owned())
                .unwrap_or(dir_name);

            let mut files = tokio::fs::read_dir(user_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().to_string();
                let Some((id, rest)) = parse_saved_filename(&name) else {
                    continue;
                };
                if kept.contains_key(&id) {
                    continue;
                }
                let meta = file.metadata().await?;
                let created_at = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_else(now_millis);

                kept.insert(id.clone(), DownloadInfo {
                    id: id.clone(),
                    user_id: user_id.clone(),
                    tab_id: "unknown".to_string(),
                    url: String::new(),
                    suggested_filename: rest.clone(),
                    saved_filename: name,
                    mime_type: guess_mime(&rest).to_string(),
                    size: Some(meta.len()),
                    status: DownloadStatus::Completed,
                    error: None,
                    created_at,
                    completed_at: Some(created_at),
                    content_url: format!("/downloads/{id}/content"),
                });
                adopted += 1;
            }
        }
        Ok(adopted)
    }
}

#[cfg(test)]
mod tests {
    use camofox_engine::fake::FakeDownload;

    use super::*;

    fn test_config(tmp: &tempfile::TempDir, max_per_user: usize) -> Arc<Config> {
        Arc::new(Config {
            profiles_dir: tmp.path().join("profiles"),
            downloads_dir: tmp.path().join("downloads"),
            max_downloads_per_user: max_per_user,
            ..Config::default()
        })
    }

    async fn registry_with(tmp: &tempfile::TempDir, max_per_user: usize) -> Arc<DownloadRegistry> {
        DownloadRegistry::init(test_config(tmp, max_per_user))
            .await
            .unwrap()
    }

    #[test]
    fn sanitize_replaces_separators_and_caps_length() {
        assert_eq!(sanitize_filename("a/b\\c.pdf"), "a_b_c.pdf");
        assert_eq!(sanitize_filename("  padded.txt  "), "padded.txt");
        assert_eq!(sanitize_filename("nul\0byte"), "nulbyte");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn mime_table_is_case_insensitive_and_uses_last_dot() {
        assert_eq!(guess_mime("report.PDF"), "application/pdf");
        assert_eq!(guess_mime("archive.tar.gz"), "application/gzip");
        assert_eq!(guess_mime("index.htm"), "text/html");
        assert_eq!(guess_mime("photo.JPEG"), "image/jpeg");
        assert_eq!(guess_mime("mystery.xyz"), "application/octet-stream");
        assert_eq!(guess_mime("no-extension"), "application/octet-stream");
    }

    #[test]
    fn saved_filename_parsing_requires_uuid_prefix() {
        let id = uuid::Uuid::new_v4().to_string();
        let parsed = parse_saved_filename(&format!("{id}_report.pdf")).unwrap();
        assert_eq!(parsed.0, id);
        assert_eq!(parsed.1, "report.pdf");

        assert!(parse_saved_filename("not-a-uuid_file.txt").is_none());
        assert!(parse_saved_filename("short").is_none());
    }

    #[tokio::test]
    async fn engine_download_completes_with_size() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with(&tmp, 10).await;

        let download = Arc::new(FakeDownload::new(
            "https://a.test/report.pdf",
            "report.pdf",
            vec![0u8; 64],
        ));
        let id = registry.start_download("u1", "t1", download);

        // Wait for the spawned finalize.
        for _ in 0..50 {
            if registry.get(&id, "u1").unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let info = registry.get(&id, "u1").unwrap();
        assert_eq!(info.status, DownloadStatus::Completed);
        assert_eq!(info.size, Some(64));
        assert!(info.completed_at.is_some());
        assert_eq!(info.mime_type, "application/pdf");
        assert!(registry.file_path(&info).exists());
    }

    #[tokio::test]
    async fn canceled_download_is_marked_canceled() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with(&tmp, 10).await;

        let download = Arc::new(FakeDownload::failed(
            "https://a.test/f.bin",
            "f.bin",
            "download canceled",
        ));
        let id = registry.start_download("u1", "t1", download);
        for _ in 0..50 {
            if registry.get(&id, "u1").unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let info = registry.get(&id, "u1").unwrap();
        assert_eq!(info.status, DownloadStatus::Canceled);
    }

    #[tokio::test]
    async fn cap_evicts_oldest_terminal_entry_and_its_file() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with(&tmp, 5).await;

        let mut ids = Vec::new();
        for i in 0..5 {
            let info = registry.register("u1", "t1", "https://a.test/f", &format!("f{i}.txt"));
            let path = registry.file_path(&info);
            tokio::fs::create_dir_all(path.parent().unwrap())
                .await
                .unwrap();
            tokio::fs::write(&path, b"data").await.unwrap();
            registry.apply_terminal(&info.id, DownloadStatus::Completed, None, Some(4));
            ids.push((info.id, path));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sixth = registry.register("u1", "t1", "https://a.test/f", "f5.txt");
        let list = registry.list_for_user("u1");
        assert_eq!(list.len(), 5);
        assert!(list.iter().all(|info| info.id != ids[0].0));
        assert!(list.iter().any(|info| info.id == sixth.id));
        assert!(!ids[0].1.exists());
    }

    #[tokio::test]
    async fn cap_never_evicts_pending_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with(&tmp, 2).await;

        let p1 = registry.register("u1", "t1", "https://a.test/1", "a.txt");
        let p2 = registry.register("u1", "t1", "https://a.test/2", "b.txt");
        // Both pending and at the cap: the next insert has no victim.
        let p3 = registry.register("u1", "t1", "https://a.test/3", "c.txt");

        assert!(registry.get(&p1.id, "u1").is_ok());
        assert!(registry.get(&p2.id, "u1").is_ok());
        assert!(registry.get(&p3.id, "u1").is_ok());
    }

    #[tokio::test]
    async fn ttl_cleanup_skips_pending_and_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            profiles_dir: tmp.path().join("profiles"),
            downloads_dir: tmp.path().join("downloads"),
            download_ttl: Duration::from_millis(50),
            ..Config::default()
        });
        let registry = DownloadRegistry::init(config).await.unwrap();

        let old = registry.register("u1", "t1", "https://a.test/1", "old.txt");
        registry.apply_terminal(&old.id, DownloadStatus::Failed, None, None);
        let pending = registry.register("u1", "t1", "https://a.test/2", "pending.txt");

        tokio::time::sleep(Duration::from_millis(80)).await;
        let fresh = registry.register("u1", "t1", "https://a.test/3", "fresh.txt");
        registry.apply_terminal(&fresh.id, DownloadStatus::Completed, None, Some(1));

        registry.cleanup_expired();
        assert!(registry.get(&old.id, "u1").is_err());
        assert!(registry.get(&pending.id, "u1").is_ok());
        assert!(registry.get(&fresh.id, "u1").is_ok());
    }

    #[tokio::test]
    async fn ownership_is_checked_on_every_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with(&tmp, 10).await;
        let info = registry.register("u1", "t1", "https://a.test/f", "f.txt");

        assert!(registry.get(&info.id, "u1").is_ok());
        assert!(matches!(
            registry.get(&info.id, "u2"),
            Err(CoreError::NotFound(_))
        ));
        assert!(registry.delete(&info.id, "u2").await.is_err());
    }

    #[tokio::test]
    async fn content_requires_completed_status() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with(&tmp, 10).await;
        let info = registry.register("u1", "t1", "https://a.test/f", "f.txt");

        let err = registry.content_path(&info.id, "u1").unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        registry.apply_terminal(&info.id, DownloadStatus::Completed, None, Some(1));
        assert!(registry.content_path(&info.id, "u1").is_ok());
    }

    #[tokio::test]
    async fn reconciliation_drops_fileless_and_adopts_orphans() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp, 10);

        // A registry file referencing one surviving file and one missing.
        let survivor_id = uuid::Uuid::new_v4().to_string();
        let ghost_id = uuid::Uuid::new_v4().to_string();
        let user_dir = config.user_downloads_dir("u1");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(user_dir.join(format!("{survivor_id}_keep.csv")), b"1,2").unwrap();

        let mk = |id: &str, name: &str| DownloadInfo {
            id: id.to_string(),
            user_id: "u1".into(),
            tab_id: "t1".into(),
            url: "https://a.test/f".into(),
            suggested_filename: name.into(),
            saved_filename: format!("{id}_{name}"),
            mime_type: guess_mime(name).to_string(),
            size: Some(3),
            status: DownloadStatus::Completed,
            error: None,
            created_at: 1,
            completed_at: Some(1),
            content_url: format!("/downloads/{id}/content"),
        };
        let mut persisted = HashMap::new();
        persisted.insert(survivor_id.clone(), mk(&survivor_id, "keep.csv"));
        persisted.insert(ghost_id.clone(), mk(&ghost_id, "gone.csv"));
        std::fs::create_dir_all(&config.downloads_dir).unwrap();
        std::fs::write(
            config.downloads_dir.join("registry.json"),
            serde_json::to_string(&persisted).unwrap(),
        )
        .unwrap();

        // An orphan file the registry never saw, plus junk that must be
        // ignored.
        let orphan_id = uuid::Uuid::new_v4().to_string();
        std::fs::write(user_dir.join(format!("{orphan_id}_found.pdf")), b"pdf").unwrap();
        std::fs::write(user_dir.join("random-junk.tmp"), b"x").unwrap();

        let registry = DownloadRegistry::init(config).await.unwrap();

        assert!(registry.get(&survivor_id, "u1").is_ok());
        assert!(registry.get(&ghost_id, "u1").is_err());

        let adopted = registry.get(&orphan_id, "u1").unwrap();
        assert_eq!(adopted.status, DownloadStatus::Completed);
        assert_eq!(adopted.tab_id, "unknown");
        assert_eq!(adopted.mime_type, "application/pdf");
        assert_eq!(adopted.size, Some(3));
    }

    #[tokio::test]
    async fn reconciliation_completes_interrupted_pending_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp, 10);

        let id = uuid::Uuid::new_v4().to_string();
        let user_dir = config.user_downloads_dir("u1");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(user_dir.join(format!("{id}_partial.bin")), b"bytes").unwrap();

        let mut persisted = HashMap::new();
        persisted.insert(id.clone(), DownloadInfo {
            id: id.clone(),
            user_id: "u1".into(),
            tab_id: "t1".into(),
            url: "https://a.test/partial.bin".into(),
            suggested_filename: "partial.bin".into(),
            saved_filename: format!("{id}_partial.bin"),
            mime_type: "application/octet-stream".into(),
            size: None,
            status: DownloadStatus::Pending,
            error: None,
            created_at: 1,
            completed_at: None,
            content_url: format!("/downloads/{id}/content"),
        });
        std::fs::create_dir_all(&config.downloads_dir).unwrap();
        std::fs::write(
            config.downloads_dir.join("registry.json"),
            serde_json::to_string(&persisted).unwrap(),
        )
        .unwrap();

        let registry = DownloadRegistry::init(config).await.unwrap();
        let info = registry.get(&id, "u1").unwrap();
        assert_eq!(info.status, DownloadStatus::Completed);
        assert_eq!(info.size, Some(5));
    }

    #[tokio::test]
    async fn persist_writes_reloadable_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(&tmp, 10);
        let registry = DownloadRegistry::init(Arc::clone(&config)).await.unwrap();

        let info = registry.register("u1", "t1", "https://a.test/f.txt", "f.txt");
        let path = registry.file_path(&info);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"hello").await.unwrap();
        registry.apply_terminal(&info.id, DownloadStatus::Completed, None, Some(5));
        registry.persist_now().await.unwrap();

        // A second registry instance recovers the entry.
        let reloaded = DownloadRegistry::init(config).await.unwrap();
        let recovered = reloaded.get(&info.id, "u1").unwrap();
        assert_eq!(recovered.status, DownloadStatus::Completed);
        assert_eq!(recovered.saved_filename, info.saved_filename);
    }

    #[tokio::test]
    async fn recent_for_tab_is_windowed() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with(&tmp, 10).await;

        registry.register("u1", "tab-a", "https://a.test/1", "a.txt");
        registry.register("u1", "tab-b", "https://a.test/2", "b.txt");

        let recent = registry.recent_for_tab("tab-a", Duration::from_secs(10));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tab_id, "tab-a");

        let none = registry.recent_for_tab("tab-a", Duration::from_millis(0));
        assert!(none.len() <= 1);
    }
}
