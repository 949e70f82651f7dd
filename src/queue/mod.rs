//! 下载队列: 队列项的增删改查、优先级调度和状态转换规则。

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod error;
pub mod memory;
pub mod models;
pub mod store;

use error::{QueueError, Result};
use models::{HistoryRecord, NewVideo, QueueItem, QueueStats, QueueStatus};
use store::{HistoryStore, QueueStore};

use crate::common::config::Settings;
use crate::common::filename::output_path;
use crate::downloader::chunk::chunk_count;

pub struct QueueManager {
    store: Arc<dyn QueueStore>,
    history: Arc<dyn HistoryStore>,
    settings: Arc<Settings>,
    // 保护持久化状态的读-判断-写过程
    lock: Mutex<()>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn QueueStore>,
        history: Arc<dyn HistoryStore>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            history,
            settings,
            lock: Mutex::new(()),
        }
    }

    /// 同一个存储同时提供队列和历史记录时使用
    pub fn from_store<S>(store: Arc<S>, settings: Arc<Settings>) -> Self
    where
        S: QueueStore + HistoryStore + 'static,
    {
        Self::new(store.clone(), store, settings)
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// 视频最终写入的位置，下载器写文件和生成历史记录都用它
    pub fn output_path(&self, item: &QueueItem) -> PathBuf {
        output_path(&self.settings.download_dir, &item.author, &item.title)
    }

    // 添加一批视频，新批次整体排在已有队列项之前，批内保持原顺序
    pub async fn add_to_queue(&self, videos: Vec<NewVideo>) -> Result<Vec<QueueItem>> {
        for video in &videos {
            validate_video(video, self.settings.chunk_size)?;
        }
        if videos.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.lock.lock().await;
        let base = self
            .store
            .list()
            .await?
            .iter()
            .map(|item| item.priority)
            .max()
            .unwrap_or(0);

        let now = Utc::now();
        let total = videos.len() as i64;
        let mut created = Vec::with_capacity(videos.len());
        for (index, video) in videos.into_iter().enumerate() {
            let priority = base + (total - index as i64);
            let item = QueueItem::from_video(video, self.settings.chunk_size, priority, now);
            self.store.add(item.clone()).await?;
            debug!(
                "加入队列: {} - {} ({} 字节, {} 块, 优先级 {})",
                item.author, item.title, item.total_size, item.chunks_total, item.priority
            );
            created.push(item);
        }
        info!("已添加 {} 个视频到下载队列", created.len());
        Ok(created)
    }

    pub async fn get(&self, id: &str) -> Result<QueueItem> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<QueueItem>> {
        Ok(self.store.list().await?)
    }

    pub async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItem>> {
        Ok(self.store.list_by_status(status).await?)
    }

    /// 只删除记录，不会删除磁盘上已下载的部分文件
    pub async fn remove_from_queue(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        if !self.store.remove(id).await? {
            return Err(QueueError::NotFound(id.to_string()));
        }
        debug!("已从队列删除: {}", id);
        Ok(())
    }

    pub async fn remove_many(&self, ids: &[String]) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.store.remove_many(ids).await?)
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        Ok(self.store.clear().await?)
    }

    pub async fn pause(&self, id: &str) -> Result<QueueItem> {
        let _guard = self.lock.lock().await;
        let mut item = self.get(id).await?;
        if item.status != QueueStatus::Downloading {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                action: "暂停",
                status: item.status,
            });
        }
        item.status = QueueStatus::Paused;
        item.speed = 0;
        self.store.update(&item).await?;
        info!("⏸️ 已暂停: {} (已完成 {}/{} 块)", item.title, item.chunks_completed, item.chunks_total);
        Ok(item)
    }

    pub async fn resume(&self, id: &str) -> Result<QueueItem> {
        self.transition(id, QueueStatus::Paused, QueueStatus::Pending, "恢复")
            .await
    }

    /// 失败的队列项重新排队，保留已完成的分块
    pub async fn requeue_failed(&self, id: &str) -> Result<QueueItem> {
        let _guard = self.lock.lock().await;
        let item = self.get(id).await?;
        if item.status != QueueStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                action: "重新排队",
                status: item.status,
            });
        }
        self.store.update_status(id, QueueStatus::Pending).await?;
        self.store.set_error(id, None).await?;
        self.get(id).await
    }

    /// pending → downloading，并记录开始时间
    pub async fn mark_downloading(&self, id: &str) -> Result<QueueItem> {
        let _guard = self.lock.lock().await;
        let item = self.get(id).await?;
        if item.status != QueueStatus::Pending {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                action: "开始下载",
                status: item.status,
            });
        }
        self.store
            .update_status(id, QueueStatus::Downloading)
            .await?;
        self.store.set_start_time(id, Utc::now()).await?;
        self.store.set_error(id, None).await?;
        self.get(id).await
    }

    /// 按给定顺序重新分配优先级，作为一个整体生效
    pub async fn reorder(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Err(QueueError::InvalidInput("排序列表为空".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(QueueError::InvalidInput(format!("重复的队列项: {}", dup)));
        }
        let _guard = self.lock.lock().await;
        self.store.reorder(ids).await.map_err(|e| match e {
            store::StoreError::NotFound(id) => QueueError::NotFound(id),
            other => other.into(),
        })
    }

    /// 调度策略: 优先级最高的 pending 项，同优先级取最早加入的
    pub async fn get_next_pending(&self) -> Result<Option<QueueItem>> {
        Ok(self.store.get_next_pending().await?)
    }

    /// 标记下载完成。重复调用是安全的，只会产生一条历史记录。
    /// 首次完成时返回新写入的历史记录。
    pub async fn complete_download(&self, id: &str) -> Result<Option<HistoryRecord>> {
        let _guard = self.lock.lock().await;
        let mut item = self.get(id).await?;
        if item.status == QueueStatus::Completed {
            debug!("队列项已完成，跳过: {}", id);
            return Ok(None);
        }
        // 暂停已经持久化，不能再被完成覆盖
        if item.status == QueueStatus::Paused {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                action: "完成",
                status: item.status,
            });
        }

        item.status = QueueStatus::Completed;
        item.downloaded_size = item.total_size;
        item.chunks_completed = item.chunks_total;
        item.speed = 0;
        item.error_message = None;
        self.store.update(&item).await?;

        let record = HistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            queue_id: item.id.clone(),
            video_id: item.video_id.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            cover_url: item.cover_url.clone(),
            duration: item.duration,
            resolution: item.resolution.clone(),
            file_size: item.total_size,
            file_path: self.output_path(&item),
            downloaded_at: Utc::now(),
        };
        self.history.add_history(record.clone()).await?;
        info!("✅ 下载完成: {} -> {}", item.title, record.file_path.display());
        Ok(Some(record))
    }

    /// 标记失败，不改变重试次数
    pub async fn fail_download(&self, id: &str, message: &str) -> Result<QueueItem> {
        let _guard = self.lock.lock().await;
        let mut item = self.get(id).await?;
        if item.status == QueueStatus::Completed {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                action: "标记失败",
                status: item.status,
            });
        }
        item.status = QueueStatus::Failed;
        item.error_message = Some(message.to_string());
        item.speed = 0;
        self.store.update(&item).await?;
        warn!("❌ 下载失败: {}, 错误: {}", item.title, message);
        Ok(item)
    }

    pub async fn increment_retry_count(&self, id: &str) -> Result<u32> {
        let _guard = self.lock.lock().await;
        self.store
            .increment_retry_count(id)
            .await
            .map_err(|e| not_found_or(id, e))
    }

    pub async fn reset_retry_count(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut item = self.get(id).await?;
        item.retry_count = 0;
        self.store.update(&item).await?;
        Ok(())
    }

    /// 开始一次重试: 检查、计数和重新排队在同一次加锁内完成。
    /// 前置条件不满足时不修改任何状态。
    pub async fn begin_retry(&self, id: &str, max_retries: u32) -> Result<QueueItem> {
        let _guard = self.lock.lock().await;
        let mut item = self.get(id).await?;
        if item.status != QueueStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                action: "重试",
                status: item.status,
            });
        }
        if !Self::can_retry(&item, max_retries) {
            return Err(QueueError::RetryLimitReached {
                id: id.to_string(),
                retry_count: item.retry_count,
                max_retries,
            });
        }
        item.retry_count += 1;
        item.status = QueueStatus::Pending;
        item.error_message = None;
        self.store.update(&item).await?;
        info!("重试 {} (第 {}/{} 次)", item.title, item.retry_count, max_retries);
        Ok(item)
    }

    pub fn can_retry(item: &QueueItem, max_retries: u32) -> bool {
        item.status == QueueStatus::Failed && item.retry_count < max_retries
    }

    /// 持久化分块进度，数值会被限制在队列项的合法范围内
    pub async fn update_progress(
        &self,
        id: &str,
        downloaded_size: u64,
        chunks_completed: u32,
        speed: u64,
    ) -> Result<()> {
        let item = self.get(id).await?;
        let downloaded_size = downloaded_size.min(item.total_size);
        let chunks_completed = chunks_completed.min(item.chunks_total);
        self.store
            .update_progress(id, downloaded_size, chunks_completed, speed)
            .await
            .map_err(|e| not_found_or(id, e))
    }

    /// 进程启动时调用: 上次退出时仍处于 downloading 的队列项不可能还在下载，
    /// 转为 paused 以保留断点
    pub async fn recover_interrupted(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let mut recovered = Vec::new();
        for mut item in self.store.list_by_status(QueueStatus::Downloading).await? {
            item.status = QueueStatus::Paused;
            item.speed = 0;
            self.store.update(&item).await?;
            recovered.push(item.id);
        }
        if !recovered.is_empty() {
            info!("恢复了 {} 个中断的下载，已转为暂停状态", recovered.len());
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats {
            total: self.store.count().await?,
            ..Default::default()
        };
        for status in QueueStatus::ALL {
            stats.set(status, self.store.count_by_status(status).await?);
        }
        Ok(stats)
    }

    pub async fn history(&self) -> Result<Vec<HistoryRecord>> {
        Ok(self.history.list_history().await?)
    }

    async fn transition(
        &self,
        id: &str,
        from: QueueStatus,
        to: QueueStatus,
        action: &'static str,
    ) -> Result<QueueItem> {
        let _guard = self.lock.lock().await;
        let item = self.get(id).await?;
        if item.status != from {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                action,
                status: item.status,
            });
        }
        self.store.update_status(id, to).await?;
        self.get(id).await
    }
}

fn not_found_or(id: &str, err: store::StoreError) -> QueueError {
    match err {
        store::StoreError::NotFound(_) => QueueError::NotFound(id.to_string()),
        other => other.into(),
    }
}

fn validate_video(video: &NewVideo, chunk_size: u64) -> Result<()> {
    let parsed = url::Url::parse(&video.video_url)
        .map_err(|e| QueueError::InvalidInput(format!("无效的视频链接 {}: {}", video.video_url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(QueueError::InvalidInput(format!(
            "不支持的协议 {}: {}",
            parsed.scheme(),
            video.video_url
        )));
    }
    if chunk_count(video.total_size, chunk_size).is_none() {
        return Err(QueueError::InvalidInput(format!(
            "文件过大: {} 字节按 {} 字节分块超出分块数上限",
            video.total_size, chunk_size
        )));
    }
    Ok(())
}
