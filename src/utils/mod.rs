use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub fn sanitize_filename(filename: &str) -> String {
    // Remove or replace characters that are invalid in filenames
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '-',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov"];
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
pub const SIDECAR_EXTENSIONS: &[&str] = &["json", "txt"];

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Files in `dir` whose name contains `identifier`, split by role.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScannedFiles {
    pub videos: Vec<PathBuf>,
    pub images: Vec<PathBuf>,
    pub sidecars: Vec<PathBuf>,
}

impl ScannedFiles {
    /// Videos first, then images.
    pub fn media(&self) -> Vec<PathBuf> {
        self.videos.iter().chain(&self.images).cloned().collect()
    }
}

/// Scan `dir` (non-recursively) for files carrying `identifier` in their
/// name. The result may be empty or incomplete; callers must not assume
/// the engine's output was fully found.
pub async fn scan_for_identifier(dir: &Path, identifier: &str) -> std::io::Result<ScannedFiles> {
    let mut found = ScannedFiles::default();
    if identifier.is_empty() {
        return Ok(found);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(identifier));
        if !matches || !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        if has_extension(&path, VIDEO_EXTENSIONS) {
            found.videos.push(path);
        } else if has_extension(&path, IMAGE_EXTENSIONS) {
            found.images.push(path);
        } else if has_extension(&path, SIDECAR_EXTENSIONS) {
            found.sidecars.push(path);
        }
    }

    found.videos.sort();
    found.images.sort();
    found.sidecars.sort();
    Ok(found)
}

/// Delete `files`, logging failures instead of returning them.
pub async fn remove_files(files: &[PathBuf]) {
    for file in files {
        match tokio::fs::remove_file(file).await {
            Ok(()) => debug!("Removed {}", file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", file.display(), e),
        }
    }
}

/// Size of `path` if it still exists as a file.
pub async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

/// Summed size of those `files` that still exist; missing ones are skipped.
pub async fn existing_size(files: &[PathBuf]) -> u64 {
    let mut total = 0;
    for file in files {
        total += file_size(file).await.unwrap_or(0);
    }
    total
}

pub fn format_size(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    format!("{:.1} MB", bytes as f64 / MIB)
}
