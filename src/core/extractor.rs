use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::core::options::InstagramOptions;
use crate::core::{EngineError, ProgressRelay};

/// One file the general engine reports having written, with the metadata
/// it printed alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedFile {
    pub path: PathBuf,
    pub info: Map<String, Value>,
}

/// The general media-extraction engine (YouTube, VK).
#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch metadata only; no media bytes are transferred.
    async fn probe(&self, url: &str, args: &[String]) -> Result<Value, EngineError>;

    /// Download `url` with the given engine arguments, relaying progress and
    /// returning every file the engine reported.
    async fn download(
        &self,
        url: &str,
        args: &[String],
        relay: &ProgressRelay,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProducedFile>, EngineError>;
}

/// The social-post engine (Instagram).
///
/// The engine writes into its working directory and does not report which
/// files it produced; callers locate them afterwards.
#[async_trait]
pub trait PostEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write the post's media (and metadata sidecars) into `options.target_dir`.
    async fn download_post(
        &self,
        options: &InstagramOptions,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Write only the post's metadata sidecar into `workdir`.
    async fn fetch_post_metadata(
        &self,
        options: &InstagramOptions,
        workdir: &Path,
    ) -> Result<(), EngineError>;

    /// Log in with a password and save the resulting session to
    /// `session_file`.
    async fn login(
        &self,
        username: &str,
        password: &str,
        session_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;
}
