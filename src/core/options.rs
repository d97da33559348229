//! Per-platform engine options.
//!
//! `build_options` turns an abstract request (platform, quality, output
//! location) plus the current [`Settings`] into a typed option set for the
//! engine that serves that platform. General-engine options render to
//! command-line arguments; Instagram options are consumed by the post engine.

use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

use crate::config::credentials::usable_credential_file;
use crate::config::Settings;
use crate::core::platform::instagram_shortcode;
use crate::core::{DownloadError, Platform, Quality};

/// Options shared by every general-engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonOptions {
    pub format: String,
    /// Output template already joined onto the output directory.
    pub output_template: PathBuf,
    pub cookie_file: Option<PathBuf>,
    pub proxy: Option<Url>,
    pub retries: u32,
    pub socket_timeout: u64,
    /// KiB/s
    pub rate_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YouTubeOptions {
    pub common: CommonOptions,
    pub merge_output_format: String,
    pub embed_thumbnail: bool,
    pub embed_metadata: bool,
    pub subtitle_languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VkOptions {
    pub common: CommonOptions,
    pub user_agent: String,
    pub referer: Url,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstagramSession {
    pub username: String,
    pub session_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstagramOptions {
    pub shortcode: String,
    pub target_dir: PathBuf,
    pub session: Option<InstagramSession>,
    pub save_metadata: bool,
    pub download_videos: bool,
    pub download_video_thumbnails: bool,
    pub max_connection_attempts: u32,
    pub request_timeout: u64,
}

/// Engine options for one download, tagged by platform.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOptions {
    YouTube(YouTubeOptions),
    Instagram(InstagramOptions),
    Vk(VkOptions),
}

impl EngineOptions {
    pub fn platform(&self) -> Platform {
        match self {
            EngineOptions::YouTube(_) => Platform::YouTube,
            EngineOptions::Instagram(_) => Platform::Instagram,
            EngineOptions::Vk(_) => Platform::Vk,
        }
    }

    /// Command-line arguments for the general engine, without the URL.
    /// `None` for Instagram, which the general engine does not serve.
    pub fn general_args(&self) -> Option<Vec<String>> {
        match self {
            EngineOptions::YouTube(opts) => Some(opts.to_args()),
            EngineOptions::Vk(opts) => Some(opts.to_args()),
            EngineOptions::Instagram(_) => None,
        }
    }

    /// General-engine arguments for a metadata-only probe.
    pub fn probe_args(&self) -> Option<Vec<String>> {
        match self {
            EngineOptions::YouTube(opts) => Some(opts.common.probe_args()),
            EngineOptions::Vk(opts) => {
                let mut args = opts.common.probe_args();
                args.extend([
                    "--user-agent".to_string(),
                    opts.user_agent.clone(),
                    "--referer".to_string(),
                    opts.referer.to_string(),
                ]);
                Some(args)
            }
            EngineOptions::Instagram(_) => None,
        }
    }
}

/// Everything `build_options` needs besides the settings.
#[derive(Debug, Clone)]
pub struct OptionRequest<'a> {
    pub platform: Platform,
    pub url: &'a str,
    pub quality: &'a Quality,
    pub output_dir: &'a Path,
    pub filename_template: Option<&'a str>,
}

pub fn build_options(
    request: &OptionRequest<'_>,
    settings: &Settings,
) -> Result<EngineOptions, DownloadError> {
    match request.platform {
        Platform::YouTube => {
            let common = common_options(
                youtube_format(request.quality),
                settings.youtube.cookies_file.as_deref(),
                request,
                settings,
            )?;
            Ok(EngineOptions::YouTube(YouTubeOptions {
                common,
                merge_output_format: settings.youtube.merge_output_format.clone(),
                embed_thumbnail: settings.youtube.embed_thumbnail,
                embed_metadata: settings.youtube.embed_metadata,
                subtitle_languages: settings
                    .youtube
                    .subtitles
                    .then(|| settings.youtube.subtitles_languages.clone()),
            }))
        }
        Platform::Vk => {
            let max_height = parse_height(&settings.vk.max_quality).unwrap_or(1080);
            let common = common_options(
                vk_format(request.quality, max_height),
                settings.vk.cookies_file.as_deref(),
                request,
                settings,
            )?;
            let referer = Url::parse(&settings.vk.referer).map_err(|e| {
                DownloadError::InvalidConfig(format!("vk.referer {:?}: {}", settings.vk.referer, e))
            })?;
            Ok(EngineOptions::Vk(VkOptions {
                common,
                user_agent: settings.vk.user_agent.clone(),
                referer,
            }))
        }
        Platform::Instagram => {
            let shortcode =
                instagram_shortcode(request.url).ok_or_else(|| DownloadError::InvalidUrl {
                    platform: Platform::Instagram,
                    url: request.url.to_string(),
                })?;
            let session_file = usable_credential_file(settings.instagram.session_file.as_deref())
                .or_else(|| usable_credential_file(settings.instagram.cookies_file.as_deref()));
            let session = match (settings.instagram.username.as_deref(), session_file) {
                (Some(username), Some(session_file)) => Some(InstagramSession {
                    username: username.to_string(),
                    session_file,
                }),
                (None, Some(session_file)) => {
                    warn!(
                        "Ignoring Instagram credentials {}: instagram.username is not set",
                        session_file.display()
                    );
                    None
                }
                _ => None,
            };
            Ok(EngineOptions::Instagram(InstagramOptions {
                shortcode,
                target_dir: request.output_dir.to_path_buf(),
                session,
                save_metadata: settings.instagram.save_metadata,
                download_videos: settings.instagram.download_videos,
                download_video_thumbnails: settings.instagram.download_video_thumbnails,
                max_connection_attempts: settings.retries.max(1),
                request_timeout: settings.timeout,
            }))
        }
        Platform::Unknown => Err(DownloadError::UnsupportedPlatform(request.url.to_string())),
    }
}

fn common_options(
    format: String,
    cookie_file: Option<&Path>,
    request: &OptionRequest<'_>,
    settings: &Settings,
) -> Result<CommonOptions, DownloadError> {
    let template = request
        .filename_template
        .unwrap_or(settings.output_template.as_str());
    let proxy = settings
        .proxy
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            Url::parse(p).map_err(|e| DownloadError::InvalidConfig(format!("proxy {:?}: {}", p, e)))
        })
        .transpose()?;

    Ok(CommonOptions {
        format,
        output_template: request.output_dir.join(template),
        cookie_file: usable_credential_file(cookie_file),
        proxy,
        retries: settings.retries,
        socket_timeout: settings.timeout,
        rate_limit: settings.rate_limit,
    })
}

pub fn youtube_format(quality: &Quality) -> String {
    match quality {
        Quality::Lowest => "worst".to_string(),
        Quality::Low => "worst[height<=360]".to_string(),
        Quality::Medium => "best[height<=720]".to_string(),
        Quality::High => "best[height<=1080]".to_string(),
        Quality::Highest => "bestvideo+bestaudio/best".to_string(),
        Quality::AudioOnly => "bestaudio/best".to_string(),
        Quality::Format(spec) => spec.clone(),
    }
}

pub fn vk_format(quality: &Quality, max_height: u32) -> String {
    match quality {
        Quality::Lowest => "worst".to_string(),
        Quality::Low => "worst[height<=360]".to_string(),
        Quality::Medium => "best[height<=480]".to_string(),
        Quality::High => "best[height<=720]".to_string(),
        Quality::Highest => format!("best[height<={}]", max_height),
        Quality::AudioOnly => "bestaudio/best".to_string(),
        Quality::Format(spec) => spec.clone(),
    }
}

/// `"1080p"` / `"720"` into a pixel height.
fn parse_height(label: &str) -> Option<u32> {
    label.trim().trim_end_matches(['p', 'P']).parse().ok()
}

impl CommonOptions {
    fn push_args(&self, args: &mut Vec<String>) {
        args.extend([
            "-f".to_string(),
            self.format.clone(),
            "-o".to_string(),
            self.output_template.to_string_lossy().into_owned(),
            "--retries".to_string(),
            self.retries.to_string(),
            "--fragment-retries".to_string(),
            self.retries.to_string(),
            "--socket-timeout".to_string(),
            self.socket_timeout.to_string(),
        ]);
        if let Some(cookie_file) = &self.cookie_file {
            args.push("--cookies".to_string());
            args.push(cookie_file.to_string_lossy().into_owned());
        }
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.to_string());
        }
        if let Some(rate) = self.rate_limit {
            args.push("--limit-rate".to_string());
            args.push(format!("{}K", rate));
        }
    }

    /// Arguments for a metadata-only probe: authentication and network
    /// settings, no format or output.
    pub fn probe_args(&self) -> Vec<String> {
        let mut args = vec![
            "--socket-timeout".to_string(),
            self.socket_timeout.to_string(),
        ];
        if let Some(cookie_file) = &self.cookie_file {
            args.push("--cookies".to_string());
            args.push(cookie_file.to_string_lossy().into_owned());
        }
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.to_string());
        }
        args
    }
}

impl YouTubeOptions {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        self.common.push_args(&mut args);
        args.push("--merge-output-format".to_string());
        args.push(self.merge_output_format.clone());
        if self.embed_thumbnail {
            args.push("--embed-thumbnail".to_string());
        }
        if self.embed_metadata {
            args.push("--embed-metadata".to_string());
        }
        if let Some(languages) = &self.subtitle_languages {
            args.extend([
                "--write-subs".to_string(),
                "--embed-subs".to_string(),
                "--sub-langs".to_string(),
                languages.join(","),
            ]);
        }
        args
    }
}

impl VkOptions {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        self.common.push_args(&mut args);
        args.extend([
            "--user-agent".to_string(),
            self.user_agent.clone(),
            "--referer".to_string(),
            self.referer.to_string(),
        ]);
        args
    }
}

impl InstagramOptions {
    /// Arguments for the post engine. The target directory is not part of
    /// them: the engine is started inside it.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--dirname-pattern".to_string(),
            ".".to_string(),
            "--filename-pattern".to_string(),
            "{date_utc}_UTC_{shortcode}".to_string(),
            "--no-compress-json".to_string(),
            "--no-captions".to_string(),
            "--no-profile-pic".to_string(),
            "--max-connection-attempts".to_string(),
            self.max_connection_attempts.to_string(),
            "--request-timeout".to_string(),
            self.request_timeout.to_string(),
            "--quiet".to_string(),
        ];
        if !self.download_videos {
            args.push("--no-videos".to_string());
        }
        if !self.download_video_thumbnails {
            args.push("--no-video-thumbnails".to_string());
        }
        if let Some(session) = &self.session {
            args.extend([
                "--login".to_string(),
                session.username.clone(),
                "--sessionfile".to_string(),
                session.session_file.to_string_lossy().into_owned(),
            ]);
        }
        args
    }

    /// Target argument selecting a single post by shortcode.
    pub fn target(&self) -> String {
        format!("-{}", self.shortcode)
    }
}
