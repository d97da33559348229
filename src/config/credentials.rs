use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ConfigError, ConfigStore};
use crate::core::Platform;
use crate::utils::sanitize_filename;

/// Ways a caller can hand over authentication for a platform.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// Raw cookie file contents, written verbatim.
    Text(String),
    /// Existing cookie file, copied verbatim.
    File(PathBuf),
    /// Cookie name to value pairs, converted into a Netscape cookie file
    /// scoped to the platform's domain.
    Cookies(BTreeMap<String, String>),
}

const COOKIE_FILE_HEADER: &str = "# Netscape HTTP Cookie File";

/// Render cookies in the tab-separated Netscape format:
/// domain, include-subdomains, path, secure, expiry, name, value.
pub fn netscape_cookie_file(domain: &str, cookies: &BTreeMap<String, String>) -> String {
    let mut content = String::from(COOKIE_FILE_HEADER);
    content.push('\n');
    for (name, value) in cookies {
        content.push_str(&format!("{}\tTRUE\t/\tFALSE\t0\t{}\t{}\n", domain, name, value));
    }
    content
}

/// Per-platform cookie and session files, referenced from the config.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    config: Arc<ConfigStore>,
    cookies_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(config: Arc<ConfigStore>) -> Result<Self, ConfigError> {
        let cookies_dir = config.dir().join("cookies");
        std::fs::create_dir_all(&cookies_dir).map_err(|source| ConfigError::Io {
            path: cookies_dir.clone(),
            source,
        })?;
        Ok(Self {
            config,
            cookies_dir,
        })
    }

    pub fn cookies_dir(&self) -> &Path {
        &self.cookies_dir
    }

    fn key(platform: Platform, field: &str) -> String {
        format!("{}.{}", platform.as_str(), field)
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
        move |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Store the credential artifact for `platform` and point the config at it.
    pub fn set(&self, platform: Platform, source: CredentialSource) -> Result<PathBuf, ConfigError> {
        let domain = platform
            .cookie_domain()
            .ok_or_else(|| ConfigError::InvalidKey(platform.as_str().to_string()))?;
        let cookie_file = self
            .cookies_dir
            .join(format!("{}_cookies.txt", platform.as_str()));

        match source {
            CredentialSource::Text(text) => {
                std::fs::write(&cookie_file, text).map_err(Self::io(&cookie_file))?
            }
            CredentialSource::File(from) => {
                std::fs::copy(&from, &cookie_file).map_err(Self::io(&from))?;
            }
            CredentialSource::Cookies(cookies) => {
                std::fs::write(&cookie_file, netscape_cookie_file(domain, &cookies))
                    .map_err(Self::io(&cookie_file))?
            }
        }

        self.config.set(
            &Self::key(platform, "cookies_file"),
            Value::String(cookie_file.to_string_lossy().into_owned()),
        )?;
        if platform == Platform::Instagram && self.config.get_str("instagram.username")?.is_none() {
            warn!("Instagram cookies are ignored until instagram.username is set");
        }
        info!("Cookies set for {}", platform);
        Ok(cookie_file)
    }

    /// Configured cookie file for `platform`, whether or not it exists.
    pub fn cookie_file(&self, platform: Platform) -> Result<Option<PathBuf>, ConfigError> {
        Ok(self
            .config
            .get_str(&Self::key(platform, "cookies_file"))?
            .map(PathBuf::from))
    }

    /// Remove the stored artifact for one platform, or for all of them.
    pub fn clear(&self, platform: Option<Platform>) -> Result<(), ConfigError> {
        let platforms = match platform {
            Some(p) => vec![p],
            None => Platform::SUPPORTED.to_vec(),
        };

        for platform in platforms {
            if platform == Platform::Unknown {
                continue;
            }
            if let Some(file) = self.cookie_file(platform)? {
                match std::fs::remove_file(&file) {
                    Ok(()) => debug!("Removed {}", file.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(ConfigError::Io { path: file, source }),
                }
            }
            self.config.set(&Self::key(platform, "cookies_file"), Value::Null)?;
            info!("Cookies cleared for {}", platform);
        }
        Ok(())
    }

    /// Where the instaloader session for `username` is kept.
    pub fn instagram_session_path(&self, username: &str) -> PathBuf {
        self.cookies_dir
            .join(format!("instagram_session_{}", sanitize_filename(username)))
    }

    /// Import an instaloader session file for `username`.
    pub fn set_instagram_session(
        &self,
        username: &str,
        session_file: &Path,
    ) -> Result<PathBuf, ConfigError> {
        let target = self.instagram_session_path(username);
        std::fs::copy(session_file, &target).map_err(Self::io(session_file))?;
        self.record_instagram_session(username, target)
    }

    /// Point the config at an existing session file for `username`.
    pub fn record_instagram_session(
        &self,
        username: &str,
        session_file: PathBuf,
    ) -> Result<PathBuf, ConfigError> {
        self.config.set(
            "instagram.session_file",
            Value::String(session_file.to_string_lossy().into_owned()),
        )?;
        self.config
            .set("instagram.username", Value::String(username.to_string()))?;
        info!("Instagram session set for {}", username);
        Ok(session_file)
    }
}

/// A credential file is only worth passing along when it exists and has
/// content.
pub fn usable_credential_file(path: Option<&Path>) -> Option<PathBuf> {
    let path = path?;
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path.to_path_buf()),
        _ => {
            debug!("Skipping missing or empty credential file {}", path.display());
            None
        }
    }
}
