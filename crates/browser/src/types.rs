//! Core data model types.

use serde::{Deserialize, Serialize};

/// Identifies an interactive node inside the current accessibility tree.
///
/// `nth` is the 0-based index among nodes with identical `(role, name)` in
/// traversal order, which keeps a ref resolvable even after DOM churn — as
/// long as the page has not navigated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefInfo {
    pub role: String,
    pub name: String,
    pub nth: usize,
}

/// Lifecycle of a download entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Completed,
    Failed,
    Canceled,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One tracked download. Persisted verbatim in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub id: String,
    pub user_id: String,
    pub tab_id: String,
    pub url: String,
    pub suggested_filename: String,
    /// `{id}_{sanitized_suggested}` — the on-disk name.
    pub saved_filename: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: Option<u64>,
    pub status: DownloadStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock millis.
    pub created_at: u64,
    #[serde(default)]
    pub completed_at: Option<u64>,
    pub content_url: String,
}

impl DownloadInfo {
    /// Ordering key for cap eviction: completion time, falling back to
    /// creation time for entries that never completed.
    pub fn age_key(&self) -> u64 {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// A paginated view over an annotated snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWindow {
    pub text: String,
    pub truncated: bool,
    pub total_chars: usize,
    pub offset: usize,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

/// Per-tab counters reported by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabStats {
    pub tab_id: String,
    pub url: String,
    pub tool_calls: u64,
    pub visited_urls: Vec<String>,
    pub refs_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DownloadStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&DownloadStatus::Canceled).unwrap(),
            "\"canceled\""
        );
    }

    #[test]
    fn age_key_prefers_completion_time() {
        let mut info = DownloadInfo {
            id: "d1".into(),
            user_id: "u".into(),
            tab_id: "t".into(),
            url: "https://x.test/f".into(),
            suggested_filename: "f".into(),
            saved_filename: "d1_f".into(),
            mime_type: "application/octet-stream".into(),
            size: None,
            status: DownloadStatus::Pending,
            error: None,
            created_at: 100,
            completed_at: None,
            content_url: "/downloads/d1/content".into(),
        };
        assert_eq!(info.age_key(), 100);
        info.completed_at = Some(250);
        assert_eq!(info.age_key(), 250);
    }
}
