use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use crate::core::{DownloadResult, Platform};

/// Maximum number of entries kept on disk; the oldest are dropped first.
pub const HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Local>,
    pub platform: Platform,
    pub url: String,
    pub title: String,
    pub files: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
    pub download_time: f64,
    pub total_size: u64,
}

impl From<&DownloadResult> for HistoryEntry {
    fn from(result: &DownloadResult) -> Self {
        Self {
            timestamp: Local::now(),
            platform: result.platform,
            url: result.url.clone(),
            title: result.title.clone(),
            files: result
                .files
                .iter()
                .map(|f| f.to_string_lossy().into_owned())
                .collect(),
            success: result.success,
            error: result.error.clone(),
            download_time: result.download_time,
            total_size: result.total_size,
        }
    }
}

/// JSON-array backed download log, newest entry last.
#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Vec<HistoryEntry> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring unreadable history {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Append one entry and rewrite the file, keeping the newest
    /// [`HISTORY_CAP`] entries.
    pub async fn append(&self, entry: HistoryEntry) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.read_all().await;
        entries.push(entry);
        if entries.len() > HISTORY_CAP {
            let excess = entries.len() - HISTORY_CAP;
            entries.drain(..excess);
        }

        let text = serde_json::to_string_pretty(&entries)?;
        tokio::fs::write(&self.path, text).await
    }

    pub async fn record(&self, result: &DownloadResult) -> std::io::Result<()> {
        self.append(HistoryEntry::from(result)).await
    }

    /// The last `limit` entries, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let mut entries = self.read_all().await;
        let skip = entries.len().saturating_sub(limit);
        entries.split_off(skip)
    }
}
