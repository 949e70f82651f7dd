//! 视频下载队列引擎: 持久化队列、分块断点续传下载、指数退避重试和进度事件流。

pub mod common;
pub mod downloader;
pub mod queue;

pub use common::config::Settings;
pub use downloader::error::DownloadError;
pub use downloader::manager::{DownloadManager, RunSummary};
pub use downloader::progress::{ProgressBroadcaster, ProgressEvent, ProgressStatus};
pub use downloader::{ChunkedDownloader, DownloadHandle, DownloadOutcome};
pub use queue::QueueManager;
pub use queue::error::QueueError;
pub use queue::memory::MemoryStore;
pub use queue::models::{HistoryRecord, NewVideo, QueueItem, QueueStats, QueueStatus};
