use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::downloader::retry::RetryPolicy;

/// 默认分块大小: 2MB
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("无效的配置项 {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 下载引擎的运行配置，启动时构造一次，显式传给队列管理器和下载器
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub chunk_size: u64,
    pub concurrent_limit: usize,
    pub max_retries: u32,
    pub download_dir: PathBuf,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_factor: f64,
    /// 进度事件队列容量，队列满时丢弃新事件
    pub progress_buffer: usize,
    pub request_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrent_limit: 3,
            max_retries: 3,
            download_dir: PathBuf::from("./downloads"),
            initial_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            backoff_factor: 2.0,
            progress_buffer: 100,
            request_timeout_secs: 60,
            poll_interval_ms: 500,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36".to_string(),
        }
    }
}

impl Settings {
    /// 从 JSON 文件加载配置，缺失的字段使用默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("加载配置文件: {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.concurrent_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrent_limit",
                reason: "必须大于 0".to_string(),
            });
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "backoff_factor",
                reason: format!("必须不小于 1.0，当前为 {}", self.backoff_factor),
            });
        }
        if self.max_retry_delay_ms < self.initial_retry_delay_ms {
            return Err(ConfigError::Invalid {
                field: "max_retry_delay_ms",
                reason: "不能小于 initial_retry_delay_ms".to_string(),
            });
        }
        if self.progress_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "progress_buffer",
                reason: "必须大于 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
