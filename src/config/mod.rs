pub mod credentials;

pub use credentials::{CredentialSource, CredentialStore};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid config key: {0:?}")]
    InvalidKey(String),

    #[error("Config lock poisoned")]
    Poisoned,
}

impl<T> From<PoisonError<T>> for ConfigError {
    fn from(_: PoisonError<T>) -> Self {
        ConfigError::Poisoned
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YouTubeSettings {
    pub cookies_file: Option<PathBuf>,
    pub format: String,
    pub merge_output_format: String,
    pub embed_metadata: bool,
    pub embed_thumbnail: bool,
    pub subtitles: bool,
    pub subtitles_languages: Vec<String>,
}

impl Default for YouTubeSettings {
    fn default() -> Self {
        Self {
            cookies_file: None,
            format: "bestvideo+bestaudio/best".to_string(),
            merge_output_format: "mp4".to_string(),
            embed_metadata: true,
            embed_thumbnail: true,
            subtitles: false,
            subtitles_languages: vec!["en".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstagramSettings {
    pub cookies_file: Option<PathBuf>,
    pub session_file: Option<PathBuf>,
    pub username: Option<String>,
    pub save_metadata: bool,
    pub download_videos: bool,
    pub download_video_thumbnails: bool,
}

impl Default for InstagramSettings {
    fn default() -> Self {
        Self {
            cookies_file: None,
            session_file: None,
            username: None,
            save_metadata: false,
            download_videos: true,
            download_video_thumbnails: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VkSettings {
    pub cookies_file: Option<PathBuf>,
    pub user_agent: String,
    pub referer: String,
    pub max_quality: String,
}

impl Default for VkSettings {
    fn default() -> Self {
        Self {
            cookies_file: None,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            referer: "https://vk.com/".to_string(),
            max_quality: "1080p".to_string(),
        }
    }
}

/// Locations of the external engine executables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub ytdlp: PathBuf,
    pub instaloader: PathBuf,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ytdlp: PathBuf::from("yt-dlp"),
            instaloader: PathBuf::from("instaloader"),
        }
    }
}

/// Typed view of the configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_path: PathBuf,
    pub temp_path: PathBuf,
    pub default_quality: String,
    pub youtube: YouTubeSettings,
    pub instagram: InstagramSettings,
    pub vk: VkSettings,
    pub proxy: Option<String>,
    pub retries: u32,
    pub timeout: u64,
    /// KiB/s
    pub rate_limit: Option<u64>,
    pub concurrent_downloads: usize,
    pub output_template: String,
    pub save_history: bool,
    pub engines: EngineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            download_path: home.join("Downloads").join("VideoDownloader"),
            temp_path: std::env::temp_dir().join("video_downloader"),
            default_quality: "highest".to_string(),
            youtube: YouTubeSettings::default(),
            instagram: InstagramSettings::default(),
            vk: VkSettings::default(),
            proxy: None,
            retries: 5,
            timeout: 30,
            rate_limit: None,
            concurrent_downloads: 1,
            output_template: "%(title)s_%(resolution)s.%(ext)s".to_string(),
            save_history: true,
            engines: EngineSettings::default(),
        }
    }
}

impl Settings {
    /// `~/.video_downloader/config.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".video_downloader")
            .join("config.json")
    }

    pub fn to_document(&self) -> Result<Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Recursively fill `target` with `source`: nested objects merge, any other
/// value in `source` replaces the one in `target`. Keys only present in
/// `target` (defaults) survive, keys only in `source` (user extras) are
/// kept as well.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

/// Persisted, path-addressable configuration document.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    document: RwLock<Value>,
}

impl ConfigStore {
    /// Load the document at `path`, merged over the defaults.
    ///
    /// A missing file is created from the merged document. A file that
    /// cannot be parsed is left alone and the defaults are used.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with_defaults(path, Settings::default())
    }

    pub fn load_with_defaults(
        path: impl Into<PathBuf>,
        defaults: Settings,
    ) -> Result<Self, ConfigError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let mut document = defaults.to_document()?;

        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(user @ Value::Object(_)) => {
                    deep_merge(&mut document, user);
                    debug!("Loaded config from {}", path.display());
                }
                Ok(_) => warn!(
                    "Config at {} is not a JSON object, using defaults",
                    path.display()
                ),
                Err(e) => warn!("Error loading config {}: {}, using defaults", path.display(), e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_document(&path, &document)?;
                info!("Created default config at {}", path.display());
            }
            Err(e) => return Err(io_err(&path)(e)),
        }

        Ok(Self {
            path,
            document: RwLock::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the config file and its sibling state.
    pub fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Look up a dotted key such as `youtube.cookies_file`. JSON `null`
    /// counts as absent.
    pub fn get(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        let document = self.document.read()?;
        let mut current = &*document;
        for part in key.split('.') {
            match current.get(part) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()).filter(|v| !v.is_null()))
    }

    pub fn get_str(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self
            .get(key)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Set a dotted key and rewrite the whole file. Missing or non-object
    /// intermediate entries are replaced with objects.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let parts: Vec<&str> = key.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::InvalidKey(key.to_string()));
        }

        let mut document = self.document.write()?;
        let mut current = &mut *document;
        for part in &parts[..parts.len() - 1] {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return Err(ConfigError::InvalidKey(key.to_string())),
            };
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        match current {
            Value::Object(map) => {
                map.insert(parts[parts.len() - 1].to_string(), value);
            }
            _ => return Err(ConfigError::InvalidKey(key.to_string())),
        }

        // Persist while still holding the write lock so that concurrent sets
        // land on disk in the same order they were applied.
        write_document(&self.path, &document)
    }

    /// Typed snapshot of the current document.
    ///
    /// A value whose type does not fit its setting is logged and replaced
    /// by the default; the rest of the document is still honoured.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let document = self.document.read()?;
        if let Ok(settings) = Settings::deserialize(&*document) {
            return Ok(settings);
        }

        let defaults = Settings::default().to_document()?;
        let mut repaired = defaults.clone();
        if let (Value::Object(default_map), Value::Object(user), Value::Object(out)) =
            (&defaults, &*document, &mut repaired)
        {
            keep_fitting_values(&defaults, &mut Vec::new(), default_map, user, out);
        }
        Ok(Settings::deserialize(&repaired)?)
    }

    pub fn snapshot(&self) -> Result<Value, ConfigError> {
        Ok(self.document.read()?.clone())
    }
}

/// Copy into `out` every value of `user` that deserializes in place of the
/// matching default, recursing into nested sections.
fn keep_fitting_values(
    defaults: &Value,
    path: &mut Vec<String>,
    default_map: &Map<String, Value>,
    user: &Map<String, Value>,
    out: &mut Map<String, Value>,
) {
    for (key, default_value) in default_map {
        let Some(user_value) = user.get(key) else {
            continue;
        };
        path.push(key.clone());
        if let (Value::Object(nested_default), Value::Object(nested_user)) = (default_value, user_value) {
            if let Some(Value::Object(nested_out)) = out.get_mut(key) {
                keep_fitting_values(defaults, path, nested_default, nested_user, nested_out);
            }
        } else if fits(defaults, path, user_value) {
            out.insert(key.clone(), user_value.clone());
        } else {
            warn!(
                "Config value {} = {} has the wrong type, using the default",
                path.join("."),
                user_value
            );
        }
        path.pop();
    }
}

/// Whether `value` at `path` deserializes when every other setting is at
/// its default.
fn fits(defaults: &Value, path: &[String], value: &Value) -> bool {
    let mut candidate = defaults.clone();
    match path
        .iter()
        .try_fold(&mut candidate, |node, key| node.get_mut(key.as_str()))
    {
        Some(slot) => *slot = value.clone(),
        None => return false,
    }
    Settings::deserialize(&candidate).is_ok()
}

fn write_document(path: &Path, document: &Value) -> Result<(), ConfigError> {
    let text = serde_json::to_string_pretty(document)?;
    std::fs::write(path, text).map_err(io_err(path))
}
