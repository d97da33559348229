pub mod downloader;
pub mod error;
pub mod extractor;
pub mod history;
pub mod metadata;
pub mod options;
pub mod platform;
pub mod progress;

pub use downloader::Downloader;
pub use error::{DownloadError, EngineError, ErrorKind};
pub use extractor::{MediaEngine, PostEngine, ProducedFile};
pub use history::{HistoryEntry, HistoryLog, HISTORY_CAP};
pub use metadata::{DownloadResult, FormatDescriptor, Quality, VideoInfo};
pub use options::{
    build_options, CommonOptions, EngineOptions, InstagramOptions, InstagramSession, OptionRequest,
    VkOptions, YouTubeOptions,
};
pub use platform::{classify, Platform};
pub use progress::{BatchEvent, BatchSink, ProgressRelay, ProgressSink, ProgressStatus, ProgressUpdate};
