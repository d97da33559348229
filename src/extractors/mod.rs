pub mod instaloader;
pub mod ytdlp;

pub use instaloader::{InstaloaderEngine, PostMetadata};
pub use ytdlp::YtDlpEngine;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::{EngineError, ErrorKind};

/// Resolve an engine executable: explicit paths are checked directly, bare
/// names are looked up on `PATH`.
pub fn locate_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    which::which(program).ok()
}

fn spawn_error(engine: &'static str, program: &Path, err: std::io::Error) -> EngineError {
    let message = if err.kind() == std::io::ErrorKind::NotFound {
        format!("{} is not installed ({} not found)", engine, program.display())
    } else {
        format!("failed to start {}: {}", engine, err)
    };
    EngineError::new(engine, ErrorKind::Fatal, message)
}

pub(crate) struct ProcessOutcome {
    pub status: ExitStatus,
    /// Every line the handler did not consume, from both streams.
    pub transcript: String,
}

fn absorb<F: FnMut(&str) -> bool>(engine: &str, line: &str, on_line: &mut F, transcript: &mut String) {
    if !on_line(line) {
        debug!("[{}] {}", engine, line);
        transcript.push_str(line);
        transcript.push('\n');
    }
}

/// Run `command`, feeding each stdout/stderr line to `on_line` as soon as it
/// arrives. The child is killed when `cancel` fires.
pub(crate) async fn run_streaming<F>(
    engine: &'static str,
    mut command: Command,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<ProcessOutcome, EngineError>
where
    F: FnMut(&str) -> bool,
{
    let program = PathBuf::from(command.as_std().get_program());
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| spawn_error(engine, &program, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::new(engine, ErrorKind::Fatal, "stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::new(engine, ErrorKind::Fatal, "stderr not captured"))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let (mut out_open, mut err_open) = (true, true);
    let mut transcript = String::new();

    while out_open || err_open {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(EngineError::cancelled(engine));
            }
            line = out_lines.next_line(), if out_open => match line {
                Ok(Some(line)) => absorb(engine, &line, &mut on_line, &mut transcript),
                _ => out_open = false,
            },
            line = err_lines.next_line(), if err_open => match line {
                Ok(Some(line)) => absorb(engine, &line, &mut on_line, &mut transcript),
                _ => err_open = false,
            },
        }
    }

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| {
            EngineError::new(engine, ErrorKind::Fatal, format!("{} process failed: {}", engine, e))
        })?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(EngineError::cancelled(engine));
        }
    };

    Ok(ProcessOutcome { status, transcript })
}

/// Run `command` to completion and return its stdout.
pub(crate) async fn run_captured(engine: &'static str, mut command: Command) -> Result<String, EngineError> {
    let program = PathBuf::from(command.as_std().get_program());
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(engine, &program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::from_output(engine, &stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
