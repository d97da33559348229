use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use clipsave::config::{ConfigStore, CredentialSource, Settings};
use clipsave::core::{
    build_options, BatchEvent, DownloadError, Downloader, EngineError, EngineOptions, ErrorKind,
    InstagramOptions, MediaEngine, OptionRequest, Platform, PostEngine, ProducedFile,
    ProgressRelay, ProgressStatus, ProgressUpdate, Quality,
};

/// Stands in for yt-dlp: writes one file per URL next to the `-o` template.
#[derive(Default)]
struct FakeMediaEngine {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    probes: AtomicUsize,
}

fn output_dir(args: &[String]) -> PathBuf {
    args.iter()
        .position(|a| a == "-o")
        .and_then(|i| args.get(i + 1))
        .and_then(|template| Path::new(template).parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn media_id(url: &str) -> String {
    url.rsplit(['/', '=']).next().unwrap_or("media").to_string()
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    fn name(&self) -> &'static str {
        "fake-media"
    }

    async fn probe(&self, url: &str, _args: &[String]) -> Result<Value, EngineError> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "id": media_id(url),
            "title": "Fake clip",
            "uploader": "Fake channel",
            "duration": 42,
            "view_count": 1000 + n,
            "formats": [
                {"format_id": "18", "ext": "mp4", "height": 360},
                {"format_id": "22", "ext": "mp4", "height": 720}
            ]
        }))
    }

    async fn download(
        &self,
        url: &str,
        args: &[String],
        relay: &ProgressRelay,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProducedFile>, EngineError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = rand::thread_rng().gen_range(1..40);
        let outcome = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay)) => Ok(()),
            _ = cancel.cancelled() => Err(EngineError::cancelled(self.name())),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome?;

        if url.contains("hang") {
            cancel.cancelled().await;
            return Err(EngineError::cancelled(self.name()));
        }
        if url.contains("fail") {
            return Err(EngineError::new(
                self.name(),
                ErrorKind::TransientIo,
                "ERROR: Read timed out",
            ));
        }

        relay.relay_line(r#"[progress] {"status": "downloading", "downloaded_bytes": 5, "total_bytes": 10}"#);
        relay.relay_line(r#"[progress] {"status": "finished", "downloaded_bytes": 10, "total_bytes": 10}"#);

        let id = media_id(url);
        let path = output_dir(args).join(format!("{}.mp4", id));
        std::fs::write(&path, vec![0u8; 10]).map_err(|e| {
            EngineError::new(self.name(), ErrorKind::Fatal, e.to_string())
        })?;

        let mut info = serde_json::Map::new();
        info.insert("id".into(), id.clone().into());
        info.insert("title".into(), format!("Clip {}", id).into());
        info.insert("view_count".into(), 7.into());
        Ok(vec![ProducedFile { path, info }])
    }
}

/// Stands in for instaloader: writes media and sidecars named after the
/// shortcode into the directory it is pointed at.
#[derive(Default)]
struct FakePostEngine {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn sidecar(shortcode: &str) -> String {
    json!({"node": {
        "shortcode": shortcode,
        "is_video": true,
        "video_duration": 9.0,
        "edge_media_to_caption": {"edges": [{"node": {"text": "Beach day"}}]},
        "owner": {"username": "someone"},
        "edge_media_preview_like": {"count": 3},
        "video_view_count": 50
    }})
    .to_string()
}

#[async_trait]
impl PostEngine for FakePostEngine {
    fn name(&self) -> &'static str {
        "fake-post"
    }

    async fn download_post(
        &self,
        options: &InstagramOptions,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = rand::thread_rng().gen_range(5..30);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let base = options
            .target_dir
            .join(format!("2024-05-01_10-00-00_UTC_{}", options.shortcode));
        let write = |ext: &str, contents: &[u8]| {
            std::fs::write(base.with_extension(ext), contents)
                .map_err(|e| EngineError::new("fake-post", ErrorKind::Fatal, e.to_string()))
        };
        write("mp4", &[1u8; 20])?;
        write("jpg", &[2u8; 5])?;
        write("json", sidecar(&options.shortcode).as_bytes())?;
        write("txt", b"Beach day")?;
        Ok(())
    }

    async fn fetch_post_metadata(
        &self,
        options: &InstagramOptions,
        workdir: &Path,
    ) -> Result<(), EngineError> {
        let path = workdir.join(format!("2024-05-01_10-00-00_UTC_{}.json", options.shortcode));
        std::fs::write(path, sidecar(&options.shortcode))
            .map_err(|e| EngineError::new("fake-post", ErrorKind::Fatal, e.to_string()))
    }

    async fn login(
        &self,
        username: &str,
        password: &str,
        session_file: &Path,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if password == "wrong" {
            return Err(EngineError::new(
                "fake-post",
                ErrorKind::AuthenticationRequired,
                "Login error: Wrong password.",
            ));
        }
        std::fs::write(session_file, format!("session-for-{}", username))
            .map_err(|e| EngineError::new("fake-post", ErrorKind::Fatal, e.to_string()))
    }
}

struct Fixture {
    dir: TempDir,
    media: Arc<FakeMediaEngine>,
    post: Arc<FakePostEngine>,
    downloader: Downloader,
}

fn fixture_with(adjust: impl FnOnce(&mut Settings), post: bool) -> Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let mut settings = Settings::default();
    settings.download_path = dir.path().join("downloads");
    settings.temp_path = dir.path().join("tmp");
    settings.concurrent_downloads = 4;
    adjust(&mut settings);

    let config = Arc::new(ConfigStore::load_with_defaults(
        dir.path().join("config.json"),
        settings,
    )?);
    let media = Arc::new(FakeMediaEngine::default());
    let post_engine = Arc::new(FakePostEngine::default());
    let attached: Option<Arc<dyn PostEngine>> = if post {
        Some(post_engine.clone())
    } else {
        None
    };
    let downloader = Downloader::with_engines(config, media.clone(), attached)?;
    Ok(Fixture {
        dir,
        media,
        post: post_engine,
        downloader,
    })
}

fn fixture() -> Result<Fixture> {
    fixture_with(|_| {}, true)
}

#[tokio::test]
async fn test_construction_creates_directories() -> Result<()> {
    let fx = fixture()?;
    assert!(fx.dir.path().join("downloads").is_dir());
    assert!(fx.dir.path().join("tmp").is_dir());
    assert!(fx.dir.path().join("cookies").is_dir());
    Ok(())
}

#[tokio::test]
async fn test_unknown_platform_is_failed_result() -> Result<()> {
    let fx = fixture()?;
    let result = fx
        .downloader
        .download("https://example.com/x", &Quality::Highest, None, None, None)
        .await?;

    assert!(!result.success);
    assert_eq!(result.platform, Platform::Unknown);
    assert_eq!(result.error_kind, Some(ErrorKind::UnsupportedPlatform));
    assert!(!result.error.unwrap_or_default().is_empty());
    assert!(result.files.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_youtube_download_reports_files_and_progress() -> Result<()> {
    let fx = fixture()?;
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();

    let result = fx
        .downloader
        .download(
            "https://youtu.be/QPQH6dP40YM",
            &Quality::High,
            None,
            None,
            Some(Arc::new(move |u: &ProgressUpdate| {
                seen.lock().unwrap().push(u.clone())
            })),
        )
        .await?;

    assert!(result.success);
    assert!(result.error.is_none());
    assert_eq!(result.title, "Clip QPQH6dP40YM");
    assert_eq!(result.files, vec![fx.dir.path().join("downloads/QPQH6dP40YM.mp4")]);
    assert_eq!(result.total_size, 10);
    assert_eq!(result.metadata["views"], json!(7));
    assert!(result.download_time >= 0.0);

    let events = events.lock().unwrap();
    let finished: Vec<_> = events
        .iter()
        .filter(|u| u.status == ProgressStatus::Finished)
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].filename.as_deref(), Some(result.files[0].as_path()));
    assert_eq!(events[0].percentage, 50.0);
    Ok(())
}

#[tokio::test]
async fn test_engine_failure_is_classified() -> Result<()> {
    let fx = fixture()?;
    let result = fx
        .downloader
        .download("https://vk.com/video-1_fail", &Quality::Highest, None, None, None)
        .await?;

    assert!(!result.success);
    assert_eq!(result.platform, Platform::Vk);
    assert_eq!(result.error_kind, Some(ErrorKind::TransientIo));
    assert!(result.error.unwrap_or_default().contains("timed out"));
    Ok(())
}

#[tokio::test]
async fn test_missing_file_excluded_from_total_size() -> Result<()> {
    let fx = fixture()?;
    let out = fx.dir.path().join("custom");
    let result = fx
        .downloader
        .download("https://youtu.be/abc", &Quality::Lowest, Some(&out), None, None)
        .await?;
    assert!(out.join("abc.mp4").is_file());
    assert_eq!(result.total_size, 10);

    std::fs::remove_file(out.join("abc.mp4"))?;
    let size = clipsave::utils::existing_size(&result.files).await;
    assert_eq!(size, 0);
    Ok(())
}

#[tokio::test]
async fn test_download_many_preserves_input_order() -> Result<()> {
    let fx = fixture()?;
    let urls: Vec<String> = (0..8)
        .map(|n| format!("https://youtu.be/video{}", n))
        .chain(std::iter::once("https://example.com/nope".to_string()))
        .collect();

    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    let results = fx
        .downloader
        .download_many(
            &urls,
            &Quality::Highest,
            None,
            3,
            Some(Arc::new(move |e: &BatchEvent| {
                if matches!(e, BatchEvent::Completed { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })),
        )
        .await?;

    assert_eq!(results.len(), urls.len());
    for (result, url) in results.iter().zip(&urls) {
        assert_eq!(&result.url, url);
    }
    assert!(results[..8].iter().all(|r| r.success));
    assert!(!results[8].success);
    assert_eq!(completions.load(Ordering::SeqCst), urls.len());
    assert!(fx.media.max_in_flight.load(Ordering::SeqCst) <= 3);
    Ok(())
}

#[tokio::test]
async fn test_download_many_sequential_when_disabled() -> Result<()> {
    let fx = fixture_with(|s| s.concurrent_downloads = 1, true)?;
    let urls: Vec<String> = (0..4).map(|n| format!("https://youtu.be/s{}", n)).collect();

    let results = fx
        .downloader
        .download_many(&urls, &Quality::Highest, None, 4, None)
        .await?;

    assert_eq!(results.len(), 4);
    assert_eq!(fx.media.max_in_flight.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_instagram_download_finds_files_and_cleans_sidecars() -> Result<()> {
    let fx = fixture()?;
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();

    let result = fx
        .downloader
        .download(
            "https://www.instagram.com/reel/DU518DCCFvH/?igsh=abc",
            &Quality::Highest,
            None,
            None,
            Some(Arc::new(move |u: &ProgressUpdate| {
                if u.status == ProgressStatus::Finished {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })),
        )
        .await?;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.title, "Beach day");
    assert_eq!(result.files.len(), 2);
    assert!(result.files[0].to_string_lossy().ends_with("DU518DCCFvH.mp4"));
    assert_eq!(result.total_size, 25);
    assert_eq!(result.metadata["shortcode"], json!("DU518DCCFvH"));
    assert_eq!(result.metadata["likes"], json!(3));
    assert_eq!(finished.load(Ordering::SeqCst), 2);

    let leftovers: Vec<_> = std::fs::read_dir(fx.dir.path().join("downloads"))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "json" || e == "txt"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
    Ok(())
}

#[tokio::test]
async fn test_instagram_keeps_json_when_saving_metadata() -> Result<()> {
    let fx = fixture_with(|s| s.instagram.save_metadata = true, true)?;
    let result = fx
        .downloader
        .download("https://instagram.com/p/KEEP1/", &Quality::Highest, None, None, None)
        .await?;
    assert!(result.success);

    let downloads = fx.dir.path().join("downloads");
    assert!(downloads.join("2024-05-01_10-00-00_UTC_KEEP1.json").is_file());
    assert!(!downloads.join("2024-05-01_10-00-00_UTC_KEEP1.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_instagram_without_engine_fails_per_download() -> Result<()> {
    let fx = fixture_with(|_| {}, false)?;
    let result = fx
        .downloader
        .download("https://instagram.com/p/ABC/", &Quality::Highest, None, None, None)
        .await?;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Fatal));
    assert!(result.error.unwrap_or_default().contains("not installed"));
    Ok(())
}

#[tokio::test]
async fn test_instagram_url_without_shortcode_is_invalid() -> Result<()> {
    let fx = fixture()?;
    let result = fx
        .downloader
        .download("https://instagr.am/", &Quality::Highest, None, None, None)
        .await?;
    assert_eq!(result.platform, Platform::Instagram);
    assert_eq!(result.error_kind, Some(ErrorKind::InvalidUrl));
    Ok(())
}

#[tokio::test]
async fn test_get_info_is_stable() -> Result<()> {
    let fx = fixture()?;
    let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
    let first = fx.downloader.get_info(url).await?;
    let second = fx.downloader.get_info(url).await?;

    assert_eq!(first.title, second.title);
    assert_eq!(first.platform, second.platform);
    assert_eq!(first.uploader, second.uploader);
    assert_eq!(first.formats, second.formats);
    assert_eq!(first.available_qualities, vec!["360p", "720p"]);
    assert_eq!(fx.media.probes.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_get_info_unknown_platform() -> Result<()> {
    let fx = fixture()?;
    let err = assert_err!(fx.downloader.get_info("https://example.com/x").await);
    assert!(matches!(err, DownloadError::UnsupportedPlatform(_)));
    assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform);
    Ok(())
}

#[tokio::test]
async fn test_get_info_instagram() -> Result<()> {
    let fx = fixture()?;
    let info = assert_ok!(fx.downloader.get_info("https://instagram.com/reel/ABC123/").await);
    assert_eq!(info.platform, Platform::Instagram);
    assert_eq!(info.title, "Beach day");
    assert_eq!(info.duration, Some(9));
    assert_eq!(info.available_qualities, vec!["highest", "lowest"]);
    Ok(())
}

#[tokio::test]
async fn test_cancel_aborts_download() -> Result<()> {
    let fx = Arc::new(fixture()?);
    let runner = fx.clone();
    let handle = tokio::spawn(async move {
        runner
            .downloader
            .download("https://youtu.be/hang", &Quality::Highest, None, None, None)
            .await
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    fx.downloader.cancel();

    let outcome = handle.await?;
    assert!(matches!(outcome, Err(DownloadError::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn test_history_records_downloads_newest_last() -> Result<()> {
    let fx = fixture()?;
    for n in 0..3 {
        fx.downloader
            .download(&format!("https://youtu.be/h{}", n), &Quality::Highest, None, None, None)
            .await?;
    }

    let history = fx.downloader.history(2).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].url, "https://youtu.be/h1");
    assert_eq!(history[1].url, "https://youtu.be/h2");
    assert!(fx.dir.path().join("download_history.json").is_file());
    Ok(())
}

#[tokio::test]
async fn test_history_disabled() -> Result<()> {
    let fx = fixture_with(|s| s.save_history = false, true)?;
    fx.downloader
        .download("https://youtu.be/nohist", &Quality::Highest, None, None, None)
        .await?;
    assert!(fx.downloader.history(10).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_credentials_round_trip_through_config() -> Result<()> {
    let fx = fixture()?;
    let stored = fx
        .downloader
        .set_credentials(
            Platform::YouTube,
            CredentialSource::Text("# Netscape HTTP Cookie File\n".to_string()),
        )
        .await?;
    assert!(stored.is_file());

    let reloaded = ConfigStore::load(fx.dir.path().join("config.json"))?;
    assert_eq!(reloaded.settings()?.youtube.cookies_file, Some(stored.clone()));

    fx.downloader.clear_credentials(Some(Platform::YouTube)).await?;
    assert!(!stored.exists());
    assert!(fx.downloader.config().get("youtube.cookies_file")?.is_none());

    let err = assert_err!(
        fx.downloader
            .set_credentials(Platform::Unknown, CredentialSource::Text(String::new()))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::UnsupportedPlatform);
    Ok(())
}

#[tokio::test]
async fn test_instagram_session_import() -> Result<()> {
    let fx = fixture()?;
    let session = fx.dir.path().join("session-src");
    std::fs::write(&session, "session-bytes")?;

    let stored = fx
        .downloader
        .set_instagram_session("me", None, Some(&session))
        .await?;
    assert_eq!(std::fs::read_to_string(&stored)?, "session-bytes");
    let settings = fx.downloader.config().settings()?;
    assert_eq!(settings.instagram.username.as_deref(), Some("me"));
    assert_eq!(settings.instagram.session_file, Some(stored));
    Ok(())
}

#[tokio::test]
async fn test_instagram_password_login_saves_session() -> Result<()> {
    let fx = fixture()?;
    let stored = fx
        .downloader
        .set_instagram_session("me", Some("hunter2"), None)
        .await?;

    assert_eq!(stored, fx.dir.path().join("cookies").join("instagram_session_me"));
    assert_eq!(std::fs::read_to_string(&stored)?, "session-for-me");
    let settings = fx.downloader.config().settings()?;
    assert_eq!(settings.instagram.username.as_deref(), Some("me"));
    assert_eq!(settings.instagram.session_file, Some(stored));
    Ok(())
}

#[tokio::test]
async fn test_instagram_login_failures() -> Result<()> {
    let fx = fixture()?;

    let err = assert_err!(fx.downloader.set_instagram_session("me", Some("wrong"), None).await);
    assert_eq!(err.kind(), ErrorKind::AuthenticationRequired);

    let err = assert_err!(fx.downloader.set_instagram_session("me", None, None).await);
    assert!(matches!(err, DownloadError::MissingCredentials));
    assert_eq!(err.kind(), ErrorKind::AuthenticationRequired);

    let settings = fx.downloader.config().settings()?;
    assert_eq!(settings.instagram.username, None);
    assert_eq!(settings.instagram.session_file, None);
    Ok(())
}

#[tokio::test]
async fn test_instagram_cookies_reach_the_post_engine() -> Result<()> {
    let fx = fixture_with(|s| s.instagram.username = Some("me".to_string()), true)?;
    let stored = fx
        .downloader
        .set_credentials(Platform::Instagram, CredentialSource::Text("sessionid=abc".into()))
        .await?;

    let settings = fx.downloader.config().settings()?;
    let options = build_options(
        &OptionRequest {
            platform: Platform::Instagram,
            url: "https://www.instagram.com/p/ABC/",
            quality: &Quality::Highest,
            output_dir: fx.dir.path(),
            filename_template: None,
        },
        &settings,
    )?;
    let EngineOptions::Instagram(ig) = options else {
        panic!("expected instagram options");
    };
    assert_eq!(ig.session.map(|s| s.session_file), Some(stored));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_instagram_downloads_are_serialized() -> Result<()> {
    let fx = fixture()?;
    let codes = ["AAA111", "BBB222", "CCC333"];
    let urls: Vec<String> = codes
        .iter()
        .map(|code| format!("https://www.instagram.com/p/{}/", code))
        .collect();

    let results = fx
        .downloader
        .download_many(&urls, &Quality::Highest, None, 3, None)
        .await?;

    assert_eq!(fx.post.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 3);
    for (result, code) in results.iter().zip(codes) {
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.files.len(), 2);
        for file in &result.files {
            assert!(file.to_string_lossy().contains(code), "{} in {:?}", code, file);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_cleanup_temp_files() -> Result<()> {
    let fx = fixture()?;
    let stray = fx.dir.path().join("tmp").join("leftover.part");
    std::fs::write(&stray, "x")?;

    fx.downloader.cleanup_temp_files().await?;
    assert!(!stray.exists());
    assert!(fx.dir.path().join("tmp").is_dir());
    Ok(())
}
