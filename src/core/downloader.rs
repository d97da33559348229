use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, CredentialSource, CredentialStore, Settings};
use crate::core::options::{build_options, EngineOptions, InstagramOptions, OptionRequest};
use crate::core::{
    classify, BatchEvent, BatchSink, DownloadError, DownloadResult, EngineError, ErrorKind,
    HistoryEntry, HistoryLog, MediaEngine, Platform, PostEngine, ProgressRelay, ProgressSink,
    ProgressUpdate, Quality, VideoInfo,
};
use crate::extractors::instaloader::title_from_caption;
use crate::extractors::{locate_program, InstaloaderEngine, PostMetadata, YtDlpEngine};
use crate::utils::{existing_size, file_size, format_size, remove_files, scan_for_identifier};

const HISTORY_FILE: &str = "download_history.json";

/// Entry point for probing and downloading media from every supported
/// platform.
///
/// YouTube and VK are served by the general media engine, Instagram by the
/// post engine. Failures of a single download are folded into a failed
/// [`DownloadResult`]; only an unusable output directory and cancellation
/// are returned as errors.
pub struct Downloader {
    config: Arc<ConfigStore>,
    credentials: CredentialStore,
    history: HistoryLog,
    media_engine: Arc<dyn MediaEngine>,
    post_engine: Option<Arc<dyn PostEngine>>,
    cancel: CancellationToken,
    // Post downloads are located by scanning the target directory, so two
    // of them must not scan and clean up at the same time.
    instagram_lock: Mutex<()>,
}

impl Downloader {
    /// Resolve the engine executables from the configuration and build a
    /// downloader around them. The general engine is required; without the
    /// post engine Instagram downloads fail individually.
    pub fn new(config: Arc<ConfigStore>) -> Result<Self, DownloadError> {
        let settings = config.settings()?;

        let ytdlp = locate_program(&settings.engines.ytdlp).ok_or_else(|| {
            EngineError::new(
                "yt-dlp",
                ErrorKind::Fatal,
                format!("yt-dlp is not installed ({} not found)", settings.engines.ytdlp.display()),
            )
        })?;
        debug!("Using yt-dlp at {}", ytdlp.display());

        let post_engine: Option<Arc<dyn PostEngine>> =
            match locate_program(&settings.engines.instaloader) {
                Some(path) => {
                    debug!("Using instaloader at {}", path.display());
                    Some(Arc::new(InstaloaderEngine::new(path)))
                }
                None => {
                    warn!("instaloader not found, Instagram downloads are unavailable");
                    None
                }
            };

        Self::with_engines(config, Arc::new(YtDlpEngine::new(ytdlp)), post_engine)
    }

    /// Build a downloader around already constructed engines.
    pub fn with_engines(
        config: Arc<ConfigStore>,
        media_engine: Arc<dyn MediaEngine>,
        post_engine: Option<Arc<dyn PostEngine>>,
    ) -> Result<Self, DownloadError> {
        let settings = config.settings()?;
        for dir in [&settings.download_path, &settings.temp_path] {
            create_dir(dir)?;
        }

        let credentials = CredentialStore::new(config.clone())?;
        let history = HistoryLog::new(config.dir().join(HISTORY_FILE));

        Ok(Self {
            config,
            credentials,
            history,
            media_engine,
            post_engine,
            cancel: CancellationToken::new(),
            instagram_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn detect_platform(&self, url: &str) -> Platform {
        classify(url)
    }

    /// Probe metadata without downloading any media.
    pub async fn get_info(&self, url: &str) -> Result<VideoInfo, DownloadError> {
        let platform = classify(url);
        if platform == Platform::Unknown {
            return Err(DownloadError::UnsupportedPlatform(url.to_string()));
        }

        let settings = self.config.settings()?;
        create_dir(&settings.temp_path)?;
        let quality = Quality::default();
        let options = build_options(
            &OptionRequest {
                platform,
                url,
                quality: &quality,
                output_dir: &settings.temp_path,
                filename_template: None,
            },
            &settings,
        )?;

        match options {
            EngineOptions::Instagram(mut options) => {
                let post_engine = self.post_engine()?;
                let workdir = tempfile::Builder::new()
                    .prefix("instagram_probe_")
                    .tempdir_in(&settings.temp_path)?;
                options.target_dir = workdir.path().to_path_buf();

                post_engine
                    .fetch_post_metadata(&options, workdir.path())
                    .await
                    .map_err(lift)?;

                let found = scan_for_identifier(workdir.path(), &options.shortcode).await?;
                let metadata = PostMetadata::from_files(&found.sidecars).ok_or_else(|| {
                    EngineError::new(
                        post_engine.name(),
                        ErrorKind::ContentUnavailable,
                        format!("no metadata found for post {}", options.shortcode),
                    )
                })?;
                Ok(metadata.into_video_info(url, &options.shortcode))
            }
            options => {
                let args = options.probe_args().unwrap_or_default();
                let document = self.media_engine.probe(url, &args).await.map_err(lift)?;
                Ok(VideoInfo::from_engine_json(platform, url, &document))
            }
        }
    }

    /// Download one URL.
    ///
    /// Every outcome except an unusable output directory and cancellation
    /// is reported through the returned result.
    pub async fn download(
        &self,
        url: &str,
        quality: &Quality,
        output_dir: Option<&Path>,
        filename_template: Option<&str>,
        progress: Option<ProgressSink>,
    ) -> Result<DownloadResult, DownloadError> {
        let started = Instant::now();
        let platform = classify(url);
        let relay = ProgressRelay::new(progress);

        let outcome = if platform == Platform::Unknown {
            Err(DownloadError::UnsupportedPlatform(url.to_string()))
        } else {
            info!("Downloading {} from {}", url, platform);
            self.download_platform(platform, url, quality, output_dir, filename_template, &relay)
                .await
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => {
                warn!("Download of {} failed: {}", url, e);
                DownloadResult::failure(platform, url, e.kind(), e.to_string())
            }
        };

        for file in &result.files {
            if file_size(file).await.is_none() {
                warn!("Reported file is missing: {}", file.display());
            }
        }
        result.total_size = existing_size(&result.files).await;
        result.download_time = started.elapsed().as_secs_f64();

        if result.success {
            if result.files.is_empty() {
                warn!("Download of {} succeeded but no files were found", url);
            }
            info!(
                "Downloaded {} ({} file(s), {}) in {:.1}s",
                result.title,
                result.files.len(),
                format_size(result.total_size),
                result.download_time
            );
        }

        self.record(&result).await;
        Ok(result)
    }

    async fn download_platform(
        &self,
        platform: Platform,
        url: &str,
        quality: &Quality,
        output_dir: Option<&Path>,
        filename_template: Option<&str>,
        relay: &ProgressRelay,
    ) -> Result<DownloadResult, DownloadError> {
        let settings = self.config.settings()?;
        let output_dir = output_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| settings.download_path.clone());
        create_dir(&output_dir)?;

        let options = build_options(
            &OptionRequest {
                platform,
                url,
                quality,
                output_dir: &output_dir,
                filename_template,
            },
            &settings,
        )?;

        match options {
            EngineOptions::Instagram(options) => self.download_post(url, &options, relay).await,
            options => {
                let args = options.general_args().unwrap_or_default();
                self.download_media(platform, url, &args, relay).await
            }
        }
    }

    async fn download_media(
        &self,
        platform: Platform,
        url: &str,
        args: &[String],
        relay: &ProgressRelay,
    ) -> Result<DownloadResult, DownloadError> {
        let produced = self
            .media_engine
            .download(url, args, relay, &self.cancel)
            .await
            .map_err(lift)?;

        let mut files: Vec<PathBuf> = Vec::with_capacity(produced.len());
        for file in &produced {
            if files.contains(&file.path) {
                continue;
            }
            let size = file_size(&file.path).await.unwrap_or(0);
            relay.emit(&ProgressUpdate::finished(Some(file.path.clone()), size));
            files.push(file.path.clone());
        }

        let info = produced.first().map(|f| &f.info);
        let title = info
            .and_then(|i| i.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let metadata = info.map(media_summary).unwrap_or_default();

        Ok(DownloadResult::success(platform, url, title, files, metadata))
    }

    async fn download_post(
        &self,
        url: &str,
        options: &InstagramOptions,
        relay: &ProgressRelay,
    ) -> Result<DownloadResult, DownloadError> {
        let post_engine = self.post_engine()?;
        let _guard = self.instagram_lock.lock().await;

        post_engine
            .download_post(options, &self.cancel)
            .await
            .map_err(lift)?;

        let found = scan_for_identifier(&options.target_dir, &options.shortcode).await?;
        let metadata = PostMetadata::from_files(&found.sidecars);

        let stray: Vec<PathBuf> = found
            .sidecars
            .iter()
            .filter(|f| {
                !options.save_metadata || !f.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"))
            })
            .cloned()
            .collect();
        remove_files(&stray).await;

        let files = found.media();
        for file in &files {
            let size = file_size(file).await.unwrap_or(0);
            relay.emit(&ProgressUpdate::finished(Some(file.clone()), size));
        }

        let title = match &metadata {
            Some(metadata) => metadata.title(&options.shortcode),
            None => title_from_caption(None, &options.shortcode),
        };
        let mut summary = metadata.map(|m| m.summary()).unwrap_or_default();
        summary.insert("shortcode".into(), options.shortcode.clone().into());

        Ok(DownloadResult::success(
            Platform::Instagram,
            url,
            title,
            files,
            summary,
        ))
    }

    /// Download every URL, at most `max_concurrent` at a time, returning one
    /// result per URL in input order.
    ///
    /// Runs sequentially unless both `max_concurrent` and the configured
    /// `concurrent_downloads` are above one.
    pub async fn download_many(
        &self,
        urls: &[String],
        quality: &Quality,
        output_dir: Option<&Path>,
        max_concurrent: usize,
        events: Option<BatchSink>,
    ) -> Result<Vec<DownloadResult>, DownloadError> {
        let settings = self.config.settings()?;
        let limit = if max_concurrent > 1 && settings.concurrent_downloads > 1 {
            max_concurrent
        } else {
            1
        };
        info!("Downloading {} URL(s), {} at a time", urls.len(), limit);

        let sink = events.clone();
        let tasks = urls.iter().enumerate().map(move |(index, url)| {
            let progress: Option<ProgressSink> = sink.clone().map(|sink| {
                Arc::new(move |update: &ProgressUpdate| {
                    sink(&BatchEvent::Progress {
                        index,
                        update: update.clone(),
                    })
                }) as ProgressSink
            });
            async move {
                let outcome = self.download(url, quality, output_dir, None, progress).await;
                (index, url, outcome)
            }
        });

        let mut completed = stream::iter(tasks).buffer_unordered(limit);
        let mut results = Vec::with_capacity(urls.len());
        while let Some((index, url, outcome)) = completed.next().await {
            let result = match outcome {
                Ok(result) => result,
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => DownloadResult::failure(classify(url), url.as_str(), e.kind(), e.to_string()),
            };
            if let Some(events) = &events {
                events(&BatchEvent::Completed {
                    index,
                    url: url.clone(),
                    success: result.success,
                });
            }
            results.push((index, result));
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    pub async fn set_credentials(
        &self,
        platform: Platform,
        source: CredentialSource,
    ) -> Result<PathBuf, DownloadError> {
        if platform == Platform::Unknown {
            return Err(DownloadError::UnsupportedPlatform(platform.to_string()));
        }
        Ok(self.credentials.set(platform, source)?)
    }

    /// Clear stored credentials for one platform, or for all when `None`.
    pub async fn clear_credentials(&self, platform: Option<Platform>) -> Result<(), DownloadError> {
        Ok(self.credentials.clear(platform)?)
    }

    /// Store an Instagram session for `username`, either imported from an
    /// existing session file or created by logging in with `password`.
    pub async fn set_instagram_session(
        &self,
        username: &str,
        password: Option<&str>,
        session_file: Option<&Path>,
    ) -> Result<PathBuf, DownloadError> {
        if let Some(session_file) = session_file {
            return Ok(self.credentials.set_instagram_session(username, session_file)?);
        }
        let password = password.ok_or(DownloadError::MissingCredentials)?;

        let engine = self.post_engine()?;
        let target = self.credentials.instagram_session_path(username);
        engine
            .login(username, password, &target, &self.cancel)
            .await
            .map_err(lift)?;
        if !target.is_file() {
            return Err(EngineError::new(
                engine.name(),
                ErrorKind::AuthenticationRequired,
                format!("login for {} did not produce a session file", username),
            )
            .into());
        }
        Ok(self.credentials.record_instagram_session(username, target)?)
    }

    /// The last `limit` downloads, most recent last.
    pub async fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.recent(limit).await
    }

    /// Empty the temp directory.
    pub async fn cleanup_temp_files(&self) -> Result<(), DownloadError> {
        let temp = self.config.settings()?.temp_path;
        match tokio::fs::remove_dir_all(&temp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        create_dir(&temp)?;
        info!("Temp files cleaned up");
        Ok(())
    }

    /// Kill every running engine process. Downloads in flight, and any
    /// started afterwards, return [`DownloadError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn post_engine(&self) -> Result<&Arc<dyn PostEngine>, DownloadError> {
        self.post_engine.as_ref().ok_or_else(|| {
            EngineError::new(
                "instaloader",
                ErrorKind::Fatal,
                "instaloader is not installed",
            )
            .into()
        })
    }

    async fn record(&self, result: &DownloadResult) {
        let save = match self.config.settings() {
            Ok(settings) => settings.save_history,
            Err(e) => {
                warn!("Could not read settings: {}", e);
                Settings::default().save_history
            }
        };
        if !save {
            return;
        }
        if let Err(e) = self.history.record(result).await {
            warn!("Error saving history to {}: {}", self.history.path().display(), e);
        }
    }
}

fn create_dir(path: &Path) -> Result<(), DownloadError> {
    std::fs::create_dir_all(path).map_err(|source| DownloadError::OutputDirectory {
        path: path.display().to_string(),
        source,
    })
}

/// Engine cancellation aborts the whole operation; every other engine error
/// becomes part of a failed result.
fn lift(err: EngineError) -> DownloadError {
    if err.kind == ErrorKind::Cancelled {
        DownloadError::Cancelled
    } else {
        DownloadError::Engine(err)
    }
}

/// Result metadata from the general engine's completion line.
fn media_summary(info: &Map<String, Value>) -> Map<String, Value> {
    let mut summary = Map::new();
    for (from, to) in [
        ("id", "id"),
        ("uploader", "uploader"),
        ("duration", "duration"),
        ("view_count", "views"),
        ("like_count", "likes"),
    ] {
        summary.insert(to.into(), info.get(from).cloned().unwrap_or(Value::Null));
    }
    summary
}
