use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::{ErrorKind, Platform};

/// Requested output quality.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Quality {
    Lowest,
    Low,
    Medium,
    High,
    #[default]
    Highest,
    AudioOnly,
    /// Engine-specific format expression, passed through untouched.
    Format(String),
}

impl Quality {
    pub fn as_str(&self) -> &str {
        match self {
            Quality::Lowest => "lowest",
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Highest => "highest",
            Quality::AudioOnly => "audio_only",
            Quality::Format(spec) => spec,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "lowest" => Quality::Lowest,
            "low" => Quality::Low,
            "medium" => Quality::Medium,
            "high" => Quality::High,
            "highest" | "best" => Quality::Highest,
            "audio_only" | "audio-only" | "audio" => Quality::AudioOnly,
            _ => Quality::Format(s.trim().to_string()),
        })
    }
}

/// One format the engine reported for a media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub filesize: Option<u64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
}

/// Metadata probed before any media is downloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub platform: Platform,
    pub url: String,
    pub title: String,
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub views: Option<u64>,
    pub likes: Option<u64>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub formats: Vec<FormatDescriptor>,
    pub is_live: bool,
    pub available_qualities: Vec<String>,
}

impl VideoInfo {
    /// Build from a general-engine JSON document.
    pub fn from_engine_json(platform: Platform, url: &str, info: &Value) -> Self {
        let str_field = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);
        let u64_field = |key: &str| info.get(key).and_then(as_u64_lossy);

        let mut formats = Vec::new();
        let mut available_qualities: Vec<String> = Vec::new();

        for f in info
            .get("formats")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let get = |key: &str| f.get(key).and_then(Value::as_str).map(str::to_string);
            formats.push(FormatDescriptor {
                format_id: get("format_id").unwrap_or_default(),
                ext: get("ext"),
                resolution: get("resolution"),
                filesize: f
                    .get("filesize")
                    .and_then(as_u64_lossy)
                    .or_else(|| f.get("filesize_approx").and_then(as_u64_lossy)),
                vcodec: get("vcodec"),
                acodec: get("acodec"),
            });

            if let Some(height) = f.get("height").and_then(as_u64_lossy) {
                let label = format!("{}p", height);
                if !available_qualities.contains(&label) {
                    available_qualities.push(label);
                }
            }
        }

        Self {
            platform,
            url: url.to_string(),
            title: str_field("title").unwrap_or_else(|| "Unknown".to_string()),
            duration: u64_field("duration"),
            uploader: str_field("uploader"),
            views: u64_field("view_count"),
            likes: u64_field("like_count"),
            description: str_field("description"),
            thumbnail: str_field("thumbnail"),
            formats,
            is_live: info.get("is_live").and_then(Value::as_bool).unwrap_or(false),
            available_qualities,
        }
    }
}

/// Engines report durations and counts as either integers or floats.
pub(crate) fn as_u64_lossy(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
}

/// Outcome of a single download attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResult {
    pub success: bool,
    pub platform: Platform,
    pub url: String,
    pub title: String,
    pub files: Vec<PathBuf>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub metadata: Map<String, Value>,
    /// Wall-clock seconds spent on the whole operation.
    pub download_time: f64,
    /// Bytes of every produced file still present on disk.
    pub total_size: u64,
}

impl DownloadResult {
    pub fn success(
        platform: Platform,
        url: impl Into<String>,
        title: impl Into<String>,
        files: Vec<PathBuf>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            success: true,
            platform,
            url: url.into(),
            title: title.into(),
            files,
            error: None,
            error_kind: None,
            metadata,
            download_time: 0.0,
            total_size: 0,
        }
    }

    /// A failed result always carries a non-empty message.
    pub fn failure(
        platform: Platform,
        url: impl Into<String>,
        kind: ErrorKind,
        error: impl Into<String>,
    ) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = format!("download failed ({})", kind);
        }
        Self {
            success: false,
            platform,
            url: url.into(),
            title: String::new(),
            files: Vec::new(),
            error: Some(error),
            error_kind: Some(kind),
            metadata: Map::new(),
            download_time: 0.0,
            total_size: 0,
        }
    }
}
