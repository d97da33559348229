pub mod cli;
pub mod config;
pub mod core;
pub mod extractors;
pub mod utils;

pub use config::{ConfigStore, CredentialSource, Settings};
pub use core::{
    classify, BatchEvent, DownloadError, DownloadResult, Downloader, ErrorKind, HistoryEntry,
    Platform, ProgressUpdate, Quality, VideoInfo,
};
pub use extractors::{InstaloaderEngine, YtDlpEngine};
