use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::client::DownloadClient;
use crate::common::config::Settings;
use crate::queue::QueueManager;
use crate::queue::error::QueueError;
use crate::queue::models::{QueueItem, QueueStatus};

pub mod chunk;
pub mod core;
pub mod error;
pub mod manager;
pub mod progress;
pub mod retry;
pub mod task;

pub use self::core::DownloadOutcome;
use self::core::{ItemRun, run_item};
use self::error::{DownloadError, Result};
use self::progress::{ProgressBroadcaster, ProgressSender, spawn_forwarder};
use self::task::{DownloadSnapshot, DownloadState};

/// 一次已启动的下载执行
#[derive(Debug)]
pub struct DownloadHandle {
    queue_id: String,
    task: JoinHandle<Result<DownloadOutcome>>,
}

impl DownloadHandle {
    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 等待执行结束，完成/失败状态写入出错时返回错误
    pub async fn join(self) -> Result<DownloadOutcome> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DownloadError::TaskPanicked(e.to_string())),
        }
    }
}

/// `resume_all_paused` 的结果，单个失败不影响其余任务
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub started: Vec<DownloadHandle>,
    pub failed: Vec<(String, DownloadError)>,
}

/// 分块下载引擎: 管理所有正在执行的下载
pub struct ChunkedDownloader {
    queue: Arc<QueueManager>,
    client: DownloadClient,
    settings: Arc<Settings>,
    active: Arc<DashMap<String, DownloadState>>,
    root: CancellationToken,
    progress: ProgressSender,
    next_generation: AtomicU64,
}

impl ChunkedDownloader {
    /// 创建引擎，并启动把进度事件转发给 `broadcaster` 的后台任务
    pub fn new(
        queue: Arc<QueueManager>,
        client: DownloadClient,
        broadcaster: Arc<dyn ProgressBroadcaster>,
    ) -> Self {
        let settings = queue.settings().clone();
        let (progress, rx) = ProgressSender::channel(settings.progress_buffer);
        spawn_forwarder(rx, broadcaster);
        Self::with_sender(queue, client, progress)
    }

    /// 使用已有的进度发送端创建引擎
    pub fn with_sender(queue: Arc<QueueManager>, client: DownloadClient, progress: ProgressSender) -> Self {
        let settings = queue.settings().clone();
        Self {
            queue,
            client,
            settings,
            active: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
            progress,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    /// 启动一个队列项的下载。
    ///
    /// 同一队列项同时只能有一个执行；登记和检查是原子的。
    pub async fn start_download(&self, item: &QueueItem) -> Result<DownloadHandle> {
        if self.root.is_cancelled() {
            return Err(DownloadError::Shutdown);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let state = DownloadState::new(
            &item.id,
            generation,
            self.root.child_token(),
            item.chunks_completed,
        );
        match self.active.entry(item.id.clone()) {
            Entry::Occupied(_) => return Err(DownloadError::AlreadyActive(item.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
            }
        }

        let item = match self.queue.mark_downloading(&item.id).await {
            Ok(item) => item,
            Err(e) => {
                self.release(&item.id, generation);
                return Err(e.into());
            }
        };
        state.cursor.store(item.chunks_completed, Ordering::SeqCst);

        let run = ItemRun {
            path: self.queue.output_path(&item),
            item,
            client: self.client.clone(),
            queue: self.queue.clone(),
            progress: self.progress.clone(),
            policy: self.settings.retry_policy(),
            state,
        };
        let queue_id = run.item.id.clone();
        let task = tokio::spawn(run_item(run, self.active.clone()));
        Ok(DownloadHandle { queue_id, task })
    }

    /// 暂停下载: 取消执行并持久化为已暂停，保留断点
    pub async fn pause(&self, id: &str) -> Result<QueueItem> {
        if let Some((_, state)) = self.active.remove(id) {
            state.mark_paused();
            state.cancel_token.cancel();
            debug!("已通知下载任务暂停: {}", id);
        }
        Ok(self.queue.pause(id).await?)
    }

    /// 取消正在执行的下载，不修改持久化状态
    pub fn cancel(&self, id: &str) -> Result<()> {
        let (_, state) = self
            .active
            .remove(id)
            .ok_or_else(|| DownloadError::NotActive(id.to_string()))?;
        state.cancel_token.cancel();
        Ok(())
    }

    /// 恢复已暂停的下载，从断点继续
    pub async fn resume(&self, id: &str) -> Result<DownloadHandle> {
        let item = self.queue.resume(id).await?;
        self.start_download(&item).await
    }

    /// 重试失败的下载: 增加重试计数并从断点继续
    pub async fn retry(&self, id: &str) -> Result<DownloadHandle> {
        let item = self
            .queue
            .begin_retry(id, self.settings.max_retries)
            .await
            .map_err(|e| match e {
                QueueError::InvalidTransition { id, status, .. } => {
                    DownloadError::NotRetryable { id, status }
                }
                QueueError::RetryLimitReached {
                    id,
                    retry_count,
                    max_retries,
                } => DownloadError::RetryLimitReached {
                    id,
                    retry_count,
                    max_retries,
                },
                other => other.into(),
            })?;
        self.start_download(&item).await
    }

    /// 恢复所有已暂停的下载
    pub async fn resume_all_paused(&self) -> Result<ResumeReport> {
        let paused = self.queue.list_by_status(QueueStatus::Paused).await?;
        let mut report = ResumeReport::default();
        for item in paused {
            match self.resume(&item.id).await {
                Ok(handle) => report.started.push(handle),
                Err(e) => {
                    warn!("恢复下载失败: {}, 错误: {}", item.id, e);
                    report.failed.push((item.id, e));
                }
            }
        }
        Ok(report)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_downloads(&self) -> Vec<DownloadSnapshot> {
        self.active.iter().map(|entry| entry.value().snapshot()).collect()
    }

    /// 暂停所有正在执行的下载，然后取消根范围；之后不再接受新的下载
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.active.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.pause(&id).await {
                warn!("关闭时暂停下载失败: {}, 错误: {}", id, e);
            }
        }
        self.root.cancel();
        info!("下载引擎已关闭");
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    fn release(&self, id: &str, generation: u64) {
        self.active
            .remove_if(id, |_, state| state.generation == generation);
    }
}
