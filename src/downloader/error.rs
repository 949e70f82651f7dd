use thiserror::Error;

use crate::queue::error::QueueError;
use crate::queue::models::QueueStatus;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP错误: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP 请求失败，状态码: {status}，URL: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("访问被拒绝: {0}")]
    AccessDenied(String),

    #[error("请求被限流: {0}")]
    RateLimited(String),

    #[error("服务器忽略了 Range 请求: 请求 {requested} 字节，响应 {received} 字节")]
    RangeIgnored { requested: u64, received: u64 },

    #[error("文件大小不匹配: 期望 {expected} 字节，实际 {actual} 字节")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("分块 {index} 超出文件范围 ({total_size} 字节)")]
    ChunkOutOfRange { index: u32, total_size: u64 },

    #[error("任务已在下载中: {0}")]
    AlreadyActive(String),

    #[error("任务未在下载: {0}")]
    NotActive(String),

    #[error("无法重试 {id}: 当前状态为 {status}")]
    NotRetryable { id: String, status: QueueStatus },

    #[error("{id} 已达到最大重试次数 ({retry_count}/{max_retries})")]
    RetryLimitReached {
        id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("分块下载失败，已尝试 {attempts} 次: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("下载已取消")]
    Cancelled,

    #[error("下载引擎已关闭")]
    Shutdown,

    #[error("下载任务异常退出: {0}")]
    TaskPanicked(String),

    #[error("队列错误: {0}")]
    Queue(#[from] QueueError),
}

impl DownloadError {
    /// 分块级别的错误是否值得退避重试
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpError(e) => !e.is_builder() && !e.is_redirect(),
            DownloadError::HttpStatus { status, .. } => *status == 408 || *status >= 500,
            DownloadError::RateLimited(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
