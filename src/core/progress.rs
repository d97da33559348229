//! Progress normalization.
//!
//! Engines report progress in two shapes: structured byte counters (the
//! `[progress] {...}` lines produced by our progress template) and plain
//! console lines such as `[download]  42.0% of 10.00MiB at 1.00MiB/s ETA 00:05`.
//! Both are turned into [`ProgressUpdate`] and handed to the caller's sink
//! immediately; nothing is buffered.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::metadata::as_u64_lossy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Downloading,
    Finished,
}

/// Engine-independent progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub downloaded_bytes: u64,
    /// Zero when the engine does not know the size.
    pub total_bytes: u64,
    /// Zero when `total_bytes` is unknown.
    pub percentage: f64,
    /// Bytes per second.
    pub speed: Option<f64>,
    /// Seconds remaining.
    pub eta: Option<u64>,
    pub status: ProgressStatus,
    pub filename: Option<PathBuf>,
}

impl ProgressUpdate {
    pub fn downloading(downloaded_bytes: u64, total_bytes: u64) -> Self {
        let percentage = if total_bytes > 0 {
            (downloaded_bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        Self {
            downloaded_bytes,
            total_bytes,
            percentage,
            speed: None,
            eta: None,
            status: ProgressStatus::Downloading,
            filename: None,
        }
    }

    pub fn finished(filename: Option<PathBuf>, total_bytes: u64) -> Self {
        Self {
            downloaded_bytes: total_bytes,
            total_bytes,
            percentage: if total_bytes > 0 { 100.0 } else { 0.0 },
            speed: None,
            eta: None,
            status: ProgressStatus::Finished,
            filename,
        }
    }

    /// Normalize a byte-oriented engine event
    /// (`downloaded_bytes`, `total_bytes`/`total_bytes_estimate`, `speed`,
    /// `eta`, `status`, `filename`).
    pub fn from_engine_event(event: &Value) -> Option<Self> {
        let status = match event.get("status").and_then(Value::as_str)? {
            "downloading" => ProgressStatus::Downloading,
            "finished" => ProgressStatus::Finished,
            _ => return None,
        };

        let downloaded = event.get("downloaded_bytes").and_then(as_u64_lossy).unwrap_or(0);
        let total = event
            .get("total_bytes")
            .and_then(as_u64_lossy)
            .or_else(|| event.get("total_bytes_estimate").and_then(as_u64_lossy))
            .unwrap_or(0);
        let filename = event
            .get("filename")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let mut update = match status {
            ProgressStatus::Downloading => Self::downloading(downloaded, total),
            ProgressStatus::Finished => Self::finished(None, total.max(downloaded)),
        };
        update.speed = event.get("speed").and_then(Value::as_f64);
        update.eta = event.get("eta").and_then(as_u64_lossy);
        update.filename = filename;
        Some(update)
    }

    /// Normalize a textual console progress line.
    pub fn from_console_line(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix("[download]")?.trim();
        let mut tokens = rest.split_whitespace();
        let percentage: f64 = tokens.next()?.strip_suffix('%')?.parse().ok()?;

        let mut total = 0;
        let mut speed = None;
        let mut eta = None;
        while let Some(token) = tokens.next() {
            match token {
                "of" => {
                    // Estimated sizes print as `~ 61.50MiB` or `~61.50MiB`.
                    let size = match tokens.next() {
                        Some("~") => tokens.next(),
                        other => other,
                    };
                    if let Some(size) = size {
                        total = parse_size(size.trim_start_matches('~')).unwrap_or(0);
                    }
                }
                "at" => {
                    speed = tokens
                        .next()
                        .and_then(|s| s.strip_suffix("/s"))
                        .and_then(parse_size)
                        .map(|b| b as f64);
                }
                "ETA" => eta = tokens.next().and_then(parse_clock),
                _ => {}
            }
        }

        let downloaded = (total as f64 * percentage / 100.0).round() as u64;

        Some(Self {
            downloaded_bytes: downloaded,
            total_bytes: total,
            percentage: if total > 0 { percentage } else { 0.0 },
            speed,
            eta,
            status: ProgressStatus::Downloading,
            filename: None,
        })
    }
}

/// `10.00MiB` / `512KiB` / `1.2GB` / `300B` into bytes.
fn parse_size(text: &str) -> Option<u64> {
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier = match unit {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1000.0,
        "MB" => 1000.0 * 1000.0,
        "GB" => 1000.0 * 1000.0 * 1000.0,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}

/// `01:02:03` / `02:03` into seconds.
fn parse_clock(text: &str) -> Option<u64> {
    text.split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
}

/// Callback receiving normalized progress.
pub type ProgressSink = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Forwards normalized events to an optional caller-supplied sink.
#[derive(Clone, Default)]
pub struct ProgressRelay {
    sink: Option<ProgressSink>,
}

impl ProgressRelay {
    pub fn new(sink: Option<ProgressSink>) -> Self {
        Self { sink }
    }

    pub fn silent() -> Self {
        Self { sink: None }
    }

    pub fn emit(&self, update: &ProgressUpdate) {
        if let Some(sink) = &self.sink {
            sink(update);
        }
    }

    /// Feed one line of engine output; returns true when it was a progress
    /// line.
    ///
    /// Stream-level `finished` events are consumed without being forwarded:
    /// a merged download finishes several streams but produces one file, and
    /// the caller reports one `finished` per produced file itself.
    pub fn relay_line(&self, line: &str) -> bool {
        let trimmed = line.trim();
        let update = if let Some(json) = trimmed.strip_prefix("[progress]") {
            serde_json::from_str::<Value>(json.trim())
                .ok()
                .and_then(|event| ProgressUpdate::from_engine_event(&event))
        } else {
            ProgressUpdate::from_console_line(trimmed)
        };

        match update {
            Some(update) => {
                if update.status == ProgressStatus::Downloading {
                    self.emit(&update);
                }
                true
            }
            None => false,
        }
    }
}

/// Event forwarded while a batch runs: byte progress tagged with the input
/// index it belongs to, and one completion per input URL.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Progress { index: usize, update: ProgressUpdate },
    Completed { index: usize, url: String, success: bool },
}

pub type BatchSink = Arc<dyn Fn(&BatchEvent) + Send + Sync>;

impl std::fmt::Debug for ProgressRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressRelay")
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_engine_event_with_estimate() {
        let event = json!({
            "status": "downloading",
            "downloaded_bytes": 250,
            "total_bytes": null,
            "total_bytes_estimate": 1000.0,
            "speed": 125.5,
            "eta": 6,
            "filename": "/tmp/a.mp4"
        });
        let update = ProgressUpdate::from_engine_event(&event).unwrap();
        assert_eq!(update.total_bytes, 1000);
        assert_eq!(update.percentage, 25.0);
        assert_eq!(update.speed, Some(125.5));
        assert_eq!(update.eta, Some(6));
        assert_eq!(update.status, ProgressStatus::Downloading);
    }

    #[test]
    fn test_engine_event_unknown_total() {
        let event = json!({"status": "downloading", "downloaded_bytes": 42});
        let update = ProgressUpdate::from_engine_event(&event).unwrap();
        assert_eq!(update.total_bytes, 0);
        assert_eq!(update.percentage, 0.0);
    }

    #[test]
    fn test_engine_event_other_status_ignored() {
        assert!(ProgressUpdate::from_engine_event(&json!({"status": "error"})).is_none());
    }

    #[test]
    fn test_console_line() {
        let update = ProgressUpdate::from_console_line(
            "[download]  42.0% of   10.00MiB at    1.00MiB/s ETA 00:05",
        )
        .unwrap();
        assert_eq!(update.total_bytes, 10 * 1024 * 1024);
        assert_eq!(update.percentage, 42.0);
        assert_eq!(update.speed, Some((1024 * 1024) as f64));
        assert_eq!(update.eta, Some(5));
    }

    #[test]
    fn test_console_line_estimated_size() {
        let update = ProgressUpdate::from_console_line(
            "[download]  12.5% of ~  64.00MiB at    2.00MiB/s ETA 00:30",
        )
        .unwrap();
        assert_eq!(update.total_bytes, 64 * 1024 * 1024);
        assert_eq!(update.percentage, 12.5);
        assert_eq!(update.downloaded_bytes, 8 * 1024 * 1024);
        assert_eq!(update.eta, Some(30));

        let attached = ProgressUpdate::from_console_line("[download]  50.0% of ~2.00KiB").unwrap();
        assert_eq!(attached.total_bytes, 2048);
    }

    #[test]
    fn test_console_line_rejects_other_output() {
        assert!(ProgressUpdate::from_console_line("[download] Destination: a.mp4").is_none());
        assert!(ProgressUpdate::from_console_line("[youtube] Extracting URL").is_none());
    }

    #[test]
    fn test_relay_forwards_each_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let relay = ProgressRelay::new(Some(Arc::new(move |u: &ProgressUpdate| {
            sink_seen.lock().unwrap().push(u.status);
        })));

        assert!(relay.relay_line(r#"[progress] {"status": "downloading", "downloaded_bytes": 1}"#));
        assert!(relay.relay_line("[download]  50.0% of 2.00KiB at 1.00KiB/s ETA 00:01"));
        assert!(relay.relay_line(r#"[progress] {"status": "finished", "total_bytes": 5}"#));
        assert!(!relay.relay_line("[info] something"));
        relay.emit(&ProgressUpdate::finished(Some(PathBuf::from("a.mp4")), 5));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ProgressStatus::Downloading,
                ProgressStatus::Downloading,
                ProgressStatus::Finished
            ]
        );
    }
}
