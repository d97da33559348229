use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::Platform;

/// Coarse failure category attached to every failed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedPlatform,
    InvalidUrl,
    AuthenticationRequired,
    ContentUnavailable,
    TransientIo,
    Cancelled,
    Fatal,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry the same request later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientIo | Self::Cancelled)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedPlatform => "unsupported platform",
            Self::InvalidUrl => "invalid url",
            Self::AuthenticationRequired => "authentication required",
            Self::ContentUnavailable => "content unavailable",
            Self::TransientIo => "transient i/o",
            Self::Cancelled => "cancelled",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Failure reported by one of the external engines.
///
/// The message is kept verbatim; `kind` is a best-effort classification.
#[derive(Debug, Clone, Error)]
#[error("{engine}: {message}")]
pub struct EngineError {
    pub engine: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(engine: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            engine,
            kind,
            message: message.into(),
        }
    }

    /// Build an error from raw engine output, picking the most specific
    /// `ERROR:` line when one is present.
    pub fn from_output(engine: &'static str, output: &str) -> Self {
        let message = last_error_line(output).unwrap_or_else(|| {
            let trimmed = output.trim();
            if trimmed.is_empty() {
                "engine exited without output".to_string()
            } else {
                trimmed.chars().take(300).collect()
            }
        });
        Self::new(engine, classify_message(&message), message)
    }

    pub fn cancelled(engine: &'static str) -> Self {
        Self::new(engine, ErrorKind::Cancelled, "download cancelled")
    }
}

fn last_error_line(output: &str) -> Option<String> {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:") || l.to_lowercase().starts_with("fatal error"))?;

    let msg = line
        .strip_prefix("ERROR:")
        .unwrap_or(line)
        .trim()
        .to_string();
    Some(msg)
}

/// Map an engine message onto the failure taxonomy.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&[
        "login required",
        "sign in",
        "log in",
        "cookies",
        "authentication",
        "private profile",
        "private video",
        "checkpoint required",
        "two-factor",
    ]) {
        ErrorKind::AuthenticationRequired
    } else if any(&[
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporary failure",
        "temporarily",
        "http error 429",
        "too many requests",
        "http error 5",
        "network is unreachable",
    ]) {
        ErrorKind::TransientIo
    } else if any(&[
        "unavailable",
        "not available",
        "removed",
        "does not exist",
        "not found",
        "http error 404",
        "http error 410",
        "geo",
        "copyright",
        "blocked",
    ]) {
        ErrorKind::ContentUnavailable
    } else if any(&["unsupported url", "is not a valid url", "invalid url"]) {
        ErrorKind::InvalidUrl
    } else {
        ErrorKind::Fatal
    }
}

/// Errors surfaced by the downloader facade.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Invalid {platform} URL: {url}")]
    InvalidUrl { platform: Platform, url: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Could not prepare output directory {path}: {source}")]
    OutputDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Instagram login needs a session file or a password")]
    MissingCredentials,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            Self::InvalidUrl { .. } => ErrorKind::InvalidUrl,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::MissingCredentials => ErrorKind::AuthenticationRequired,
            Self::Engine(e) => e.kind,
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::Interrupted => ErrorKind::TransientIo,
                _ => ErrorKind::Fatal,
            },
            Self::InvalidConfig(_)
            | Self::OutputDirectory { .. }
            | Self::Config(_)
            | Self::Json(_) => ErrorKind::Fatal,
        }
    }

    /// Errors that must abort the top-level operation instead of being
    /// folded into a failed result.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OutputDirectory { .. } | Self::Cancelled)
    }
}
