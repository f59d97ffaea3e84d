//! Scoped DOM resource extraction and bounded-concurrency batch downloads.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    futures::future::join_all,
    serde::{Deserialize, Serialize},
    tokio::sync::Semaphore,
    tracing::{debug, warn},
};

use {
    camofox_common::{CoreError, Result},
    camofox_config::Config,
    camofox_engine::{EngineContext, EnginePage},
};

use crate::{
    downloads::{DownloadRegistry, sanitize_filename},
    types::DownloadStatus,
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Most `img` elements scrolled into view to trigger lazy loading.
const MAX_LAZY_SCROLLS: usize = 50;
/// Most blob URLs resolved to data URIs in one extraction.
const MAX_BLOB_RESOLVES: usize = 25;

/// Walk a container and collect per-type resource descriptors plus observed
/// `blob:` URLs. URLs are normalized against the document base inside the
/// page.
const EXTRACT_JS: &str = r#"
(() => {
    const container = document.querySelector(%CONTAINER%) || document.body;
    if (!container) return { resources: [], blobUrls: [] };

    if (%SCROLL_LAZY%) {
        const imgs = Array.from(container.querySelectorAll('img')).slice(0, %MAX_SCROLLS%);
        for (const img of imgs) {
            try { img.scrollIntoView({ behavior: 'instant', block: 'center' }); } catch (e) {}
        }
    }

    const normalize = (raw) => {
        if (!raw) return null;
        try { return new URL(raw, document.baseURI).href; } catch (e) { return null; }
    };

    const resources = [];
    const blobUrls = new Set();
    const push = (kind, raw, text) => {
        const url = raw && raw.startsWith('blob:') ? raw : normalize(raw);
        if (!url) return;
        if (url.startsWith('blob:')) blobUrls.add(url);
        resources.push({ kind, url, text: text || null });
    };

    for (const img of container.querySelectorAll('img[src], img[data-src]')) {
        push('images', img.currentSrc || img.src || img.getAttribute('data-src'), img.alt);
    }
    for (const a of container.querySelectorAll('a[href]')) {
        push('links', a.href, (a.innerText || '').trim().slice(0, 200));
    }
    for (const el of container.querySelectorAll('video[src], audio[src], source[src]')) {
        push('media', el.src, null);
    }
    for (const el of container.querySelectorAll('video[poster]')) {
        push('media', el.poster, null);
    }

    return { resources, blobUrls: Array.from(blobUrls) };
})()
"#;

/// Resolve blob URLs to data URIs inside the page (fetch → Blob →
/// FileReader).
const RESOLVE_BLOBS_JS: &str = r#"
(async () => {
    const out = {};
    for (const url of %URLS%) {
        try {
            const resp = await fetch(url);
            const blob = await resp.blob();
            out[url] = await new Promise((resolve) => {
                const reader = new FileReader();
                reader.onload = () => resolve({ dataUrl: reader.result, mimeType: blob.type });
                reader.onerror = () => resolve(null);
                reader.readAsDataURL(blob);
            });
        } catch (e) {
            out[url] = null;
        }
    }
    return out;
})()
"#;

/// Extensions conventionally treated as documents when classifying links.
const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".csv", ".txt", ".zip", ".gz",
    ".json",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractOptions {
    /// CSS container to scope the walk; defaults to `body`.
    pub container: Option<String>,
    /// Keep only these kinds (`images`, `links`, `media`, `documents`).
    pub types: Option<Vec<String>>,
    /// Keep only these extensions (normalized to lowercased `.ext`).
    pub extensions: Option<Vec<String>>,
    pub scroll_lazy: bool,
    pub resolve_blobs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceItem {
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedResources {
    pub resources: Vec<ResourceItem>,
    pub blob_urls: Vec<String>,
}

/// Normalize an extension filter entry to lowercased `.ext` form.
fn normalize_extension(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}

fn url_extension(url: &str) -> Option<String> {
    let path = url::Url::parse(url).ok()?.path().to_string();
    let name = path.rsplit('/').next()?.to_string();
    name.rfind('.').map(|dot| name[dot..].to_lowercase())
}

/// Classify a raw `links` hit as a document when its extension says so.
fn refine_kind(item: &ResourceItem) -> String {
    if item.kind == "links"
        && let Some(ext) = url_extension(&item.url)
        && DOCUMENT_EXTENSIONS.contains(&ext.as_str())
    {
        return "documents".to_string();
    }
    item.kind.clone()
}

/// Run the in-page extraction and apply type/extension filters.
pub async fn extract_resources(
    page: &Arc<dyn EnginePage>,
    opts: &ExtractOptions,
) -> Result<ExtractedResources> {
    let container = opts.container.clone().unwrap_or_else(|| "body".to_string());
    let encoded_container = serde_json::to_string(&container)
        .map_err(|e| CoreError::engine(e.to_string()))?;
    let script = EXTRACT_JS
        .replace("%CONTAINER%", &encoded_container)
        .replace("%SCROLL_LAZY%", if opts.scroll_lazy { "true" } else { "false" })
        .replace("%MAX_SCROLLS%", &MAX_LAZY_SCROLLS.to_string());

    let value = page
        .evaluate(&script)
        .await
        .map_err(|e| CoreError::engine(e.to_string()))?;

    let mut extracted = parse_extraction(&value);

    for item in &mut extracted.resources {
        item.kind = refine_kind(item);
    }

    if let Some(ref types) = opts.types {
        extracted
            .resources
            .retain(|item| types.iter().any(|t| t.eq_ignore_ascii_case(&item.kind)));
    }
    if let Some(ref extensions) = opts.extensions {
        let wanted: Vec<String> = extensions.iter().map(|e| normalize_extension(e)).collect();
        extracted.resources.retain(|item| {
            url_extension(&item.url)
                .map(|ext| wanted.contains(&ext))
                .unwrap_or(false)
        });
    }

    if opts.resolve_blobs && !extracted.blob_urls.is_empty() {
        let resolved = resolve_blobs(page, &extracted.blob_urls).await?;
        for item in &mut extracted.resources {
            if let Some(Some((data_url, _))) = resolved.get(&item.url) {
                item.url = data_url.clone();
            }
        }
    }

    debug!(
        resources = extracted.resources.len(),
        blobs = extracted.blob_urls.len(),
        "extracted page resources"
    );
    Ok(extracted)
}

fn parse_extraction(value: &serde_json::Value) -> ExtractedResources {
    let resources = value["resources"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(ResourceItem {
                        kind: item["kind"].as_str()?.to_string(),
                        url: item["url"].as_str()?.to_string(),
                        text: item["text"].as_str().map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let blob_urls = value["blobUrls"]
        .as_array()
        .map(|urls| {
            urls.iter()
                .filter_map(|u| u.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    ExtractedResources {
        resources,
        blob_urls,
    }
}

/// Resolve up to [`MAX_BLOB_RESOLVES`] blob URLs to `(data URI, mime)`.
pub async fn resolve_blobs(
    page: &Arc<dyn EnginePage>,
    urls: &[String],
) -> Result<HashMap<String, Option<(String, String)>>> {
    let capped: Vec<&String> = urls.iter().take(MAX_BLOB_RESOLVES).collect();
    let encoded_urls =
        serde_json::to_string(&capped).map_err(|e| CoreError::engine(e.to_string()))?;
    let script = RESOLVE_BLOBS_JS.replace("%URLS%", &encoded_urls);
    let value = page
        .evaluate(&script)
        .await
        .map_err(|e| CoreError::engine(e.to_string()))?;

    let mut out = HashMap::new();
    if let Some(map) = value.as_object() {
        for (url, entry) in map {
            let resolved = entry.as_object().and_then(|obj| {
                Some((
                    obj.get("dataUrl")?.as_str()?.to_string(),
                    obj.get("mimeType")?.as_str().unwrap_or_default().to_string(),
                ))
            });
            out.insert(url.clone(), resolved);
        }
    }
    Ok(out)
}

// ── Batch downloading ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchOptions {
    pub max_files: Option<usize>,
    pub resolve_blobs: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub download_id: String,
    pub url: String,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn filename_for(item: &BatchItem) -> String {
    if let Some(ref name) = item.filename {
        return sanitize_filename(name);
    }
    let derived = url::Url::parse(&item.url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(String::from))
        })
        .filter(|s| !s.is_empty());
    sanitize_filename(derived.as_deref().unwrap_or("download"))
}

/// Decode a `data:` URI into `(bytes, mime)`.
fn decode_data_uri(uri: &str) -> Result<(Vec<u8>, Option<String>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| CoreError::validation("not a data: URI"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| CoreError::validation("malformed data: URI"))?;

    let (mime, is_base64) = match meta.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (meta, false),
    };
    let bytes = if is_base64 {
        BASE64
            .decode(payload)
            .map_err(|e| CoreError::validation(format!("invalid base64 payload: {e}")))?
    } else {
        urlencoding::decode_binary(payload.as_bytes()).into_owned()
    };
    let mime = (!mime.is_empty()).then(|| mime.to_string());
    Ok((bytes, mime))
}

/// Download a bounded set of URLs through the user's context.
///
/// Every candidate is registered as `pending` before work starts, then moved
/// to `completed`/`failed` individually; a wholesale abort fails whatever is
/// still pending.
pub async fn batch_download(
    config: &Arc<Config>,
    registry: &Arc<DownloadRegistry>,
    context: &Arc<dyn EngineContext>,
    page: &Arc<dyn EnginePage>,
    user_id: &str,
    tab_id: &str,
    items: Vec<BatchItem>,
    opts: &BatchOptions,
) -> Vec<BatchOutcome> {
    let cap = opts
        .max_files
        .unwrap_or(config.max_batch_files)
        .clamp(1, 500);
    let skipped = items.len().saturating_sub(cap);
    if skipped > 0 {
        warn!(skipped, cap, "batch download candidates over the cap were dropped");
    }

    let candidates: Vec<(BatchItem, String)> = items
        .into_iter()
        .take(cap)
        .map(|item| {
            let info = registry.register(user_id, tab_id, &item.url, &filename_for(&item));
            (item, info.id)
        })
        .collect();

    let semaphore = Arc::new(Semaphore::new(config.max_batch_concurrency.max(1)));

    let tasks = candidates.iter().map(|(item, id)| {
        let semaphore = Arc::clone(&semaphore);
        let config = Arc::clone(config);
        let registry = Arc::clone(registry);
        let context = Arc::clone(context);
        let page = Arc::clone(page);
        let item = item.clone();
        let id = id.clone();
        let resolve = opts.resolve_blobs;
        let user_id = user_id.to_string();
        async move {
            let _slot = semaphore.acquire().await;
            let result =
                fetch_one(&config, &registry, &context, &page, &user_id, &id, &item, resolve)
                    .await;
            match result {
                Ok(size) => {
                    registry.apply_terminal(&id, DownloadStatus::Completed, None, Some(size));
                    BatchOutcome {
                        download_id: id,
                        url: item.url,
                        status: DownloadStatus::Completed,
                        error: None,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    registry.apply_terminal(
                        &id,
                        DownloadStatus::Failed,
                        Some(message.clone()),
                        None,
                    );
                    BatchOutcome {
                        download_id: id,
                        url: item.url,
                        status: DownloadStatus::Failed,
                        error: Some(message),
                    }
                }
            }
        }
    });

    let outcomes = join_all(tasks).await;

    // Anything still pending after the joins means a task never reached its
    // terminal transition; fail it rather than leave it immortal.
    for (_, id) in &candidates {
        if let Ok(info) = registry.get(id, user_id)
            && info.status == DownloadStatus::Pending
        {
            registry.apply_terminal(id, DownloadStatus::Failed, Some("batch aborted".into()), None);
        }
    }

    outcomes
}

#[allow(clippy::too_many_arguments)]
async fn fetch_one(
    config: &Arc<Config>,
    registry: &Arc<DownloadRegistry>,
    context: &Arc<dyn EngineContext>,
    page: &Arc<dyn EnginePage>,
    user_id: &str,
    id: &str,
    item: &BatchItem,
    resolve_blob_urls: bool,
) -> Result<u64> {
    let info = registry.get(id, user_id)?;
    let path = registry.file_path(&info);

    let bytes: Vec<u8> = if item.url.starts_with("data:") {
        let (bytes, _) = decode_data_uri(&item.url)?;
        enforce_cap(bytes.len() as u64, config.max_blob_size_bytes(), "blob")?;
        bytes
    } else if item.url.starts_with("blob:") {
        if !resolve_blob_urls {
            return Err(CoreError::validation(
                "blob: URL refused; pass resolveBlobs to allow in-page resolution",
            ));
        }
        let resolved = resolve_blobs(page, std::slice::from_ref(&item.url)).await?;
        let (data_url, _) = resolved
            .get(&item.url)
            .cloned()
            .flatten()
            .ok_or_else(|| CoreError::engine("blob resolution failed"))?;
        let (bytes, _) = decode_data_uri(&data_url)?;
        enforce_cap(bytes.len() as u64, config.max_blob_size_bytes(), "blob")?;
        bytes
    } else if item.url.starts_with("http:") || item.url.starts_with("https:") {
        let body = context
            .request_get(&item.url, FETCH_TIMEOUT)
            .await
            .map_err(|e| CoreError::engine(e.to_string()))?;
        enforce_cap(
            body.bytes.len() as u64,
            config.max_download_size_bytes(),
            "download",
        )?;
        body.bytes
    } else {
        return Err(CoreError::validation(format!(
            "unsupported URL scheme in batch item: {}",
            item.url
        )));
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &bytes).await?;
    Ok(bytes.len() as u64)
}

fn enforce_cap(size: u64, cap: u64, what: &str) -> Result<()> {
    if size > cap {
        return Err(CoreError::validation(format!(
            "{what} of {size} bytes exceeds the configured limit of {cap} bytes"
        )));
    }
    Ok(())
}
