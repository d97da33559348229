use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::run_streaming;
use crate::core::metadata::as_u64_lossy;
use crate::core::options::InstagramOptions;
use crate::core::{EngineError, ErrorKind, FormatDescriptor, Platform, PostEngine, VideoInfo};

const ENGINE: &str = "instaloader";

/// Exit code instaloader uses when logging in fails.
const LOGIN_FAILURE_EXIT: i32 = 3;

/// Drives the `instaloader` executable.
#[derive(Debug, Clone)]
pub struct InstaloaderEngine {
    program: PathBuf,
}

impl InstaloaderEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, options: &InstagramOptions, workdir: &Path, extra: &[&str]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(options.to_args())
            .args(extra)
            .arg("--")
            .arg(options.target())
            .current_dir(workdir);
        command
    }

    /// Log in without targets; instaloader then only writes the session.
    fn login_command(&self, username: &str, password: &str, session_file: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["--login", username, "--password", password, "--sessionfile"])
            .arg(session_file);
        if let Some(dir) = session_file.parent() {
            command.current_dir(dir);
        }
        command
    }

    async fn run(&self, command: Command, cancel: &CancellationToken) -> Result<(), EngineError> {
        let outcome = run_streaming(ENGINE, command, cancel, |_| false).await?;
        if outcome.status.success() {
            return Ok(());
        }

        let mut err = EngineError::from_output(ENGINE, &outcome.transcript);
        if outcome.status.code() == Some(LOGIN_FAILURE_EXIT) {
            err.kind = ErrorKind::AuthenticationRequired;
        }
        Err(err)
    }
}

#[async_trait]
impl PostEngine for InstaloaderEngine {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn download_post(
        &self,
        options: &InstagramOptions,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        info!("Starting {} for post {}", ENGINE, options.shortcode);
        self.run(self.command(options, &options.target_dir, &[]), cancel)
            .await
    }

    async fn fetch_post_metadata(
        &self,
        options: &InstagramOptions,
        workdir: &Path,
    ) -> Result<(), EngineError> {
        debug!("Fetching metadata for post {}", options.shortcode);
        let command = self.command(
            options,
            workdir,
            &["--no-pictures", "--no-videos", "--no-video-thumbnails"],
        );
        self.run(command, &CancellationToken::new()).await
    }

    async fn login(
        &self,
        username: &str,
        password: &str,
        session_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        info!("Logging in to Instagram as {}", username);
        self.run(self.login_command(username, password, session_file), cancel)
            .await
    }
}

/// Post details read from the engine's JSON sidecar (`{"node": {...}}`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostMetadata {
    pub shortcode: String,
    pub is_video: bool,
    pub video_duration: Option<f64>,
    pub caption: Option<String>,
    pub owner_username: Option<String>,
    pub likes: Option<u64>,
    pub video_view_count: Option<u64>,
    pub display_url: Option<String>,
    pub media_count: usize,
    pub dimensions: Option<(u64, u64)>,
}

impl PostMetadata {
    pub fn from_sidecar(document: &Value) -> Option<Self> {
        let node = document.get("node")?;
        let str_at = |pointer: &str| node.pointer(pointer).and_then(Value::as_str).map(str::to_string);
        let u64_at = |pointer: &str| node.pointer(pointer).and_then(as_u64_lossy);

        let media_count = node
            .pointer("/edge_sidecar_to_children/edges")
            .and_then(Value::as_array)
            .map(|edges| edges.len())
            .filter(|n| *n > 0)
            .unwrap_or(1);

        Some(Self {
            shortcode: str_at("/shortcode").unwrap_or_default(),
            is_video: node.get("is_video").and_then(Value::as_bool).unwrap_or(false),
            video_duration: node.get("video_duration").and_then(Value::as_f64),
            caption: str_at("/edge_media_to_caption/edges/0/node/text"),
            owner_username: str_at("/owner/username"),
            likes: u64_at("/edge_media_preview_like/count").or_else(|| u64_at("/edge_liked_by/count")),
            video_view_count: u64_at("/video_view_count"),
            display_url: str_at("/display_url"),
            media_count,
            dimensions: u64_at("/dimensions/width").zip(u64_at("/dimensions/height")),
        })
    }

    /// Read the first sidecar in `files` that parses as post metadata.
    pub fn from_files(files: &[PathBuf]) -> Option<Self> {
        files
            .iter()
            .filter(|f| f.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")))
            .filter_map(|f| std::fs::read_to_string(f).ok())
            .filter_map(|text| serde_json::from_str::<Value>(&text).ok())
            .find_map(|doc| Self::from_sidecar(&doc))
    }

    pub fn summary(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("uploader".into(), self.owner_username.clone().into());
        map.insert("likes".into(), self.likes.into());
        map.insert(
            "views".into(),
            if self.is_video { self.video_view_count.into() } else { Value::Null },
        );
        map.insert("is_video".into(), self.is_video.into());
        map.insert("media_count".into(), self.media_count.into());
        map
    }

    /// First 100 characters of the caption, or `Instagram <shortcode>`.
    pub fn title(&self, shortcode: &str) -> String {
        title_from_caption(self.caption.as_deref(), shortcode)
    }

    pub fn into_video_info(self, url: &str, shortcode: &str) -> VideoInfo {
        let title = self.title(shortcode);

        let mut available_qualities = Vec::new();
        if self.is_video {
            available_qualities.push("highest".to_string());
            if self.video_duration.is_some() {
                available_qualities.push("lowest".to_string());
            }
        }

        let kind = if self.media_count > 1 {
            "sidecar"
        } else if self.is_video {
            "video"
        } else {
            "image"
        };

        VideoInfo {
            platform: Platform::Instagram,
            url: url.to_string(),
            title,
            duration: self.video_duration.map(|d| d.round() as u64),
            uploader: self.owner_username,
            views: if self.is_video { self.video_view_count } else { None },
            likes: self.likes,
            description: self.caption,
            thumbnail: self.display_url,
            formats: vec![FormatDescriptor {
                format_id: format!("{}:{}", kind, self.media_count),
                ext: Some(if self.is_video { "mp4" } else { "jpg" }.to_string()),
                resolution: self.dimensions.map(|(w, h)| format!("{}x{}", w, h)),
                filesize: None,
                vcodec: None,
                acodec: None,
            }],
            is_live: false,
            available_qualities,
        }
    }
}

pub fn title_from_caption(caption: Option<&str>, shortcode: &str) -> String {
    caption
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| c.chars().take(100).collect())
        .unwrap_or_else(|| format!("Instagram {}", shortcode))
}
