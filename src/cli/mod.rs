use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;

use crate::config::{ConfigStore, CredentialSource, Settings};
use crate::core::{
    BatchEvent, DownloadResult, Downloader, Platform, ProgressStatus, ProgressUpdate, Quality,
    VideoInfo,
};
use crate::utils::format_size;

#[derive(Parser)]
#[command(name = "clipsave")]
#[command(about = "Download videos and posts from YouTube, Instagram and VK")]
#[command(version)]
pub struct Cli {
    /// URL to download
    #[arg(value_name = "URL")]
    pub url: Option<String>,

    /// Quality: lowest, low, medium, high, highest, audio_only or a raw format
    #[arg(short, long)]
    pub quality: Option<String>,

    /// Output directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Config file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Only show media information
    #[arg(long)]
    pub info: bool,

    /// Import a cookie file for --platform
    #[arg(long, value_name = "FILE")]
    pub set_cookies: Option<PathBuf>,

    /// Remove stored cookies (for --platform, or all platforms)
    #[arg(long)]
    pub clear_cookies: bool,

    /// Platform for cookie commands: youtube, instagram or vk
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Store an Instagram session for this user (needs --session-file or --password)
    #[arg(long, value_name = "USER")]
    pub instagram_login: Option<String>,

    /// Existing instaloader session file to import
    #[arg(long, value_name = "FILE", requires = "instagram_login")]
    pub session_file: Option<PathBuf>,

    /// Instagram password; logs in once and saves the session
    #[arg(long, requires = "instagram_login", conflicts_with = "session_file")]
    pub password: Option<String>,

    /// File with one URL per line; lines starting with # are skipped
    #[arg(short, long, value_name = "FILE")]
    pub batch: Option<PathBuf>,

    /// Number of concurrent downloads in batch mode
    #[arg(short = 'j', long, default_value = "1")]
    pub concurrent: usize,

    /// Show download history
    #[arg(long)]
    pub history: bool,

    /// Number of history entries to show
    #[arg(long, default_value = "10")]
    pub limit: usize,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// How a command ended, as seen by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Usage,
}

impl Outcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Failure => ExitCode::from(1),
            Outcome::Usage => ExitCode::from(2),
        }
    }
}

impl Cli {
    pub async fn run(&self) -> Result<Outcome> {
        let config_path = self.config.clone().unwrap_or_else(Settings::default_path);
        let config = Arc::new(ConfigStore::load(&config_path)?);
        let downloader = Downloader::new(config.clone())?;

        let token = downloader.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling downloads");
                token.cancel();
            }
        });

        if self.history {
            return Ok(self.show_history(&downloader).await);
        }

        if let Some(file) = &self.set_cookies {
            let Some(platform) = self.platform else {
                eprintln!("--set-cookies requires --platform");
                return Ok(Outcome::Usage);
            };
            let stored = downloader
                .set_credentials(platform, CredentialSource::File(file.clone()))
                .await?;
            println!("Cookies for {} saved to {}", platform, stored.display());
            return Ok(Outcome::Success);
        }

        if let Some(username) = &self.instagram_login {
            if self.session_file.is_none() && self.password.is_none() {
                eprintln!("--instagram-login requires --session-file or --password");
                return Ok(Outcome::Usage);
            }
            let stored = downloader
                .set_instagram_session(username, self.password.as_deref(), self.session_file.as_deref())
                .await?;
            println!("Instagram session for {} saved to {}", username, stored.display());
            return Ok(Outcome::Success);
        }

        if self.clear_cookies {
            downloader.clear_credentials(self.platform).await?;
            match self.platform {
                Some(platform) => println!("Cookies cleared for {}", platform),
                None => println!("Cookies cleared for all platforms"),
            }
            return Ok(Outcome::Success);
        }

        let quality: Quality = match &self.quality {
            Some(quality) => quality.parse().unwrap_or_default(),
            None => config.settings()?.default_quality.parse().unwrap_or_default(),
        };

        if let Some(batch) = &self.batch {
            return self.run_batch(&downloader, batch, &quality).await;
        }

        let Some(url) = &self.url else {
            eprintln!("No URL given (see --help)");
            return Ok(Outcome::Usage);
        };

        if self.info {
            return Ok(match downloader.get_info(url).await {
                Ok(info) => {
                    print_info(&info);
                    Outcome::Success
                }
                Err(e) => {
                    eprintln!("Error ({}): {}", e.kind(), e);
                    Outcome::Failure
                }
            });
        }

        println!("Downloading: {}", url);
        println!("Platform: {}", downloader.detect_platform(url));
        let result = downloader
            .download(
                url,
                &quality,
                self.output.as_deref(),
                None,
                Some(Arc::new(print_progress)),
            )
            .await?;
        println!();
        print_result(&result);

        Ok(if result.success {
            Outcome::Success
        } else {
            Outcome::Failure
        })
    }

    async fn run_batch(
        &self,
        downloader: &Downloader,
        batch: &Path,
        quality: &Quality,
    ) -> Result<Outcome> {
        let contents = tokio::fs::read_to_string(batch)
            .await
            .with_context(|| format!("Failed to read batch file {}", batch.display()))?;
        let urls = batch_urls(&contents);
        if urls.is_empty() {
            eprintln!("No URLs in {}", batch.display());
            return Ok(Outcome::Usage);
        }

        let total = urls.len();
        let results = downloader
            .download_many(
                &urls,
                quality,
                self.output.as_deref(),
                self.concurrent,
                Some(Arc::new(move |event: &BatchEvent| {
                    if let BatchEvent::Completed { index, url, success } = event {
                        let mark = if *success { "ok" } else { "failed" };
                        println!("[{}/{}] {} {}", index + 1, total, mark, url);
                    }
                })),
            )
            .await?;

        let failed = results.iter().filter(|r| !r.success).count();
        println!(
            "Batch finished: {} succeeded, {} failed",
            results.len() - failed,
            failed
        );
        for result in results.iter().filter(|r| !r.success) {
            println!(
                "  {}: {}",
                result.url,
                result.error.as_deref().unwrap_or_default()
            );
        }

        Ok(if failed == 0 {
            Outcome::Success
        } else {
            Outcome::Failure
        })
    }

    async fn show_history(&self, downloader: &Downloader) -> Outcome {
        let entries = downloader.history(self.limit).await;
        if entries.is_empty() {
            println!("No downloads recorded yet");
        }
        for entry in entries {
            let status = if entry.success { "ok" } else { "failed" };
            println!(
                "{} [{}] {} {} - {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.platform,
                status,
                entry.url,
                if entry.title.is_empty() {
                    entry.error.as_deref().unwrap_or_default()
                } else {
                    entry.title.as_str()
                }
            );
        }
        Outcome::Success
    }
}

/// Non-empty lines that are not `#` comments.
pub fn batch_urls(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn print_progress(update: &ProgressUpdate) {
    match update.status {
        ProgressStatus::Downloading if update.total_bytes > 0 => {
            print!(
                "\rProgress: {:.1}% ({}/{} bytes)",
                update.percentage, update.downloaded_bytes, update.total_bytes
            );
        }
        ProgressStatus::Downloading => {
            print!("\rDownloaded: {} bytes", update.downloaded_bytes);
        }
        ProgressStatus::Finished => {
            if let Some(file) = &update.filename {
                print!("\rFinished: {}", file.display());
            }
        }
    }
    let _ = std::io::stdout().flush();
}

fn print_info(info: &VideoInfo) {
    println!("Title: {}", info.title);
    println!("Platform: {}", info.platform);
    if let Some(uploader) = &info.uploader {
        println!("Uploader: {}", uploader);
    }
    if let Some(duration) = info.duration {
        println!("Duration: {}s", duration);
    }
    if let Some(views) = info.views {
        println!("Views: {}", views);
    }
    if let Some(likes) = info.likes {
        println!("Likes: {}", likes);
    }
    if info.is_live {
        println!("Live: yes");
    }
    if !info.available_qualities.is_empty() {
        println!("Qualities: {}", info.available_qualities.join(", "));
    }

    println!("Available formats: {}", info.formats.len());
    for (i, format) in info.formats.iter().enumerate().take(10) {
        println!(
            "  {}: {} - {} ({})",
            i + 1,
            format.format_id,
            format.resolution.as_deref().unwrap_or("unknown"),
            format.ext.as_deref().unwrap_or("?")
        );
    }
}

fn print_result(result: &DownloadResult) {
    if !result.success {
        eprintln!(
            "Download failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
        return;
    }

    println!("Download completed: {}", result.title);
    for file in &result.files {
        println!("  {}", file.display());
    }
    println!(
        "Size: {}, time: {:.1}s",
        format_size(result.total_size),
        result.download_time
    );
}
