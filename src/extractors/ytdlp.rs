use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{run_captured, run_streaming};
use crate::core::{EngineError, ErrorKind, MediaEngine, ProducedFile, ProgressRelay};

const ENGINE: &str = "yt-dlp";

/// Template for the per-file completion line printed after post-processing.
const DONE_TEMPLATE: &str =
    "after_move:[done] %(.{id,title,uploader,duration,view_count,like_count,filepath})j";
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress)j";

/// Drives the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: PathBuf,
}

impl YtDlpEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn probe_command(&self, url: &str, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(["--dump-single-json", "--no-warnings", "--no-playlist"])
            .args(args)
            .arg("--")
            .arg(url);
        command
    }

    fn download_command(&self, url: &str, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args([
                "--newline",
                "--progress",
                "--no-simulate",
                "--no-playlist",
                "--no-warnings",
                "--progress-template",
                PROGRESS_TEMPLATE,
                "--print",
                DONE_TEMPLATE,
            ])
            .args(args)
            .arg("--")
            .arg(url);
        command
    }
}

/// Parse a `[done] {...}` line into the produced file it describes.
pub fn parse_done_line(line: &str) -> Option<ProducedFile> {
    let json = line.trim().strip_prefix("[done]")?.trim();
    let mut info: Map<String, Value> = match serde_json::from_str(json) {
        Ok(Value::Object(map)) => map,
        _ => {
            debug!("Unparseable completion line: {}", line);
            return None;
        }
    };
    let path = match info.remove("filepath") {
        Some(Value::String(path)) if !path.is_empty() => PathBuf::from(path),
        _ => return None,
    };
    Some(ProducedFile { path, info })
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn probe(&self, url: &str, args: &[String]) -> Result<Value, EngineError> {
        debug!("Probing {}", url);
        let stdout = run_captured(ENGINE, self.probe_command(url, args)).await?;
        serde_json::from_str(stdout.trim()).map_err(|e| {
            EngineError::new(ENGINE, ErrorKind::Fatal, format!("invalid metadata JSON: {}", e))
        })
    }

    async fn download(
        &self,
        url: &str,
        args: &[String],
        relay: &ProgressRelay,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProducedFile>, EngineError> {
        info!("Starting {} for {}", ENGINE, url);
        let mut produced = Vec::new();

        let outcome = run_streaming(ENGINE, self.download_command(url, args), cancel, |line| {
            if let Some(file) = parse_done_line(line) {
                produced.push(file);
                true
            } else {
                relay.relay_line(line)
            }
        })
        .await?;

        if !outcome.status.success() {
            return Err(EngineError::from_output(ENGINE, &outcome.transcript));
        }
        Ok(produced)
    }
}
