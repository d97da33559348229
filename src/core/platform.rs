use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Platforms the downloader knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Instagram,
    Vk,
    Unknown,
}

impl Platform {
    /// Platforms that can actually be downloaded from.
    pub const SUPPORTED: [Platform; 3] = [Platform::YouTube, Platform::Instagram, Platform::Vk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Vk => "vk",
            Platform::Unknown => "unknown",
        }
    }

    /// Domain written into generated cookie files.
    pub fn cookie_domain(&self) -> Option<&'static str> {
        match self {
            Platform::YouTube => Some(".youtube.com"),
            Platform::Instagram => Some(".instagram.com"),
            Platform::Vk => Some(".vk.com"),
            Platform::Unknown => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "youtube" | "yt" => Ok(Platform::YouTube),
            "instagram" | "ig" => Ok(Platform::Instagram),
            "vk" | "vkontakte" => Ok(Platform::Vk),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

struct PatternFamilies {
    youtube: Vec<Regex>,
    instagram: Vec<Regex>,
    vk: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}

fn families() -> &'static PatternFamilies {
    static FAMILIES: OnceLock<PatternFamilies> = OnceLock::new();
    FAMILIES.get_or_init(|| PatternFamilies {
        youtube: compile(&[
            r"youtube\.com",
            r"youtu\.be",
            r"m\.youtube\.com",
            r"youtube\.com/shorts/",
            r"music\.youtube\.com",
        ]),
        instagram: compile(&[
            r"instagram\.com/p/",
            r"instagram\.com/reel/",
            r"instagram\.com/tv/",
            r"instagr\.am",
        ]),
        vk: compile(&[
            r"vk\.com/video",
            r"vk\.com/wall.*?z=video",
            r"m\.vk\.com/video",
            r"vkvideo\.ru/video",
            r"vk\.ru/video",
        ]),
    })
}

/// Map a URL onto a platform.
///
/// Families are tried in a fixed order (YouTube, Instagram, VK) and the
/// first family with a matching pattern wins. Matching is case-insensitive
/// and purely textual.
pub fn classify(url: &str) -> Platform {
    let lower = url.to_lowercase();
    let families = families();
    let ordered = [
        (Platform::YouTube, &families.youtube),
        (Platform::Instagram, &families.instagram),
        (Platform::Vk, &families.vk),
    ];

    ordered
        .into_iter()
        .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(&lower)))
        .map(|(platform, _)| platform)
        .unwrap_or(Platform::Unknown)
}

/// Extract the post shortcode from an Instagram URL.
pub fn instagram_shortcode(url: &str) -> Option<String> {
    static SHORTCODE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = SHORTCODE
        .get_or_init(|| Regex::new(r"(?:instagram\.com|instagr\.am)/(?:p|reel|reels|tv)/([^/?#&]+)").ok())
        .as_ref()?;

    re.captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|code| !code.is_empty())
}
