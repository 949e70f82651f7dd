//! 队列与下载历史的存储接口。
//!
//! 引擎只依赖这里的 trait，具体实现（关系型数据库、文件快照等）由外部提供；
//! 实现方需要自行保证并发写入的串行化。

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{HistoryRecord, QueueItem, QueueStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("记录不存在: {0}")]
    NotFound(String),

    #[error("记录已存在: {0}")]
    Duplicate(String),

    #[error("存储IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("状态文件编码失败: {0}")]
    Encode(String),

    #[error("状态文件解码失败: {0}")]
    Decode(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn add(&self, item: QueueItem) -> StoreResult<()>;
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<QueueItem>>;
    async fn update(&self, item: &QueueItem) -> StoreResult<()>;
    /// 删除记录，返回记录是否存在
    async fn remove(&self, id: &str) -> StoreResult<bool>;
    /// 批量删除，返回实际删除的条数
    async fn remove_many(&self, ids: &[String]) -> StoreResult<usize>;
    async fn clear(&self) -> StoreResult<()>;
    /// 按调度顺序返回全部记录
    async fn list(&self) -> StoreResult<Vec<QueueItem>>;
    async fn list_by_status(&self, status: QueueStatus) -> StoreResult<Vec<QueueItem>>;
    async fn update_status(&self, id: &str, status: QueueStatus) -> StoreResult<()>;
    async fn update_progress(
        &self,
        id: &str,
        downloaded_size: u64,
        chunks_completed: u32,
        speed: u64,
    ) -> StoreResult<()>;
    /// 按给定顺序赋予严格递减的优先级，必须整体生效或整体失败
    async fn reorder(&self, ids: &[String]) -> StoreResult<()>;
    async fn count(&self) -> StoreResult<usize>;
    async fn count_by_status(&self, status: QueueStatus) -> StoreResult<usize>;
    async fn get_next_pending(&self) -> StoreResult<Option<QueueItem>>;
    /// 返回递增后的重试次数
    async fn increment_retry_count(&self, id: &str) -> StoreResult<u32>;
    async fn set_start_time(&self, id: &str, start_time: DateTime<Utc>) -> StoreResult<()>;
    async fn set_error(&self, id: &str, message: Option<String>) -> StoreResult<()>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn add_history(&self, record: HistoryRecord) -> StoreResult<()>;
    async fn list_history(&self) -> StoreResult<Vec<HistoryRecord>>;
    async fn history_by_queue_id(&self, queue_id: &str) -> StoreResult<Vec<HistoryRecord>>;
}

/// 调度顺序: 优先级高的在前，相同优先级按加入时间先后
pub fn scheduling_order(a: &QueueItem, b: &QueueItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.added_time.cmp(&b.added_time))
}
