use thiserror::Error;

use super::models::QueueStatus;
use super::store::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("队列项不存在: {0}")]
    NotFound(String),

    #[error("无法{action}队列项 {id}: 当前状态为 {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: QueueStatus,
    },

    #[error("队列项 {id} 已达到最大重试次数 ({retry_count}/{max_retries})")]
    RetryLimitReached {
        id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("无效的输入: {0}")]
    InvalidInput(String),

    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, QueueError>;
