use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error::{DownloadError, Result};
use super::{ChunkedDownloader, DownloadHandle, DownloadOutcome};
use crate::queue::QueueManager;

/// 一轮调度的统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub cancelled: usize,
    /// 终态写入失败或任务异常退出的次数
    pub errors: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Completed(_) => self.completed += 1,
            DownloadOutcome::Failed(_) => self.failed += 1,
            DownloadOutcome::Paused => self.paused += 1,
            DownloadOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// 队列调度器: 按优先级取出等待项，保持同时下载的数量不超过上限
pub struct DownloadManager {
    queue: Arc<QueueManager>,
    downloader: Arc<ChunkedDownloader>,
    concurrent_limit: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl DownloadManager {
    pub fn new(downloader: Arc<ChunkedDownloader>) -> Self {
        let queue = downloader.queue().clone();
        let settings = queue.settings().clone();
        Self {
            queue,
            downloader,
            concurrent_limit: settings.concurrent_limit.max(1),
            poll_interval: settings.poll_interval(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn downloader(&self) -> &Arc<ChunkedDownloader> {
        &self.downloader
    }

    /// 取消这个令牌会让 `run_until_idle` 暂停所有下载后返回
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 在并发上限内尽可能多地启动等待中的队列项
    pub async fn fill_slots(&self) -> Result<Vec<DownloadHandle>> {
        let mut started = Vec::new();
        while self.downloader.active_count() < self.concurrent_limit {
            let Some(item) = self.queue.get_next_pending().await? else {
                break;
            };
            match self.downloader.start_download(&item).await {
                Ok(handle) => started.push(handle),
                Err(DownloadError::Shutdown) => break,
                Err(DownloadError::AlreadyActive(id)) => {
                    // 上一次执行还没退出，下一轮再试
                    warn!("队列项仍在执行中，稍后再调度: {}", id);
                    break;
                }
                Err(e) => {
                    error!("启动下载失败: {}, 错误: {}", item.id, e);
                    // 写不进失败状态时先停止填充，下一轮再试，已启动的任务照常收集
                    if let Err(e) = self.queue.fail_download(&item.id, &e.to_string()).await {
                        error!("标记下载失败时出错: {}, 错误: {}", item.id, e);
                        break;
                    }
                }
            }
        }
        Ok(started)
    }

    /// 持续调度，直到没有等待项也没有正在执行的下载，或收到关闭信号
    pub async fn run_until_idle(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut handles: Vec<DownloadHandle> = Vec::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            handles.extend(self.fill_slots().await?);

            let (finished, running): (Vec<_>, Vec<_>) =
                handles.into_iter().partition(|h| h.is_finished());
            handles = running;
            for handle in finished {
                Self::collect(handle, &mut summary).await;
            }

            if handles.is_empty() && self.queue.get_next_pending().await?.is_none() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }

        if self.shutdown.is_cancelled() {
            info!("收到关闭信号，正在暂停所有下载...");
            self.downloader.shutdown().await;
        }
        for handle in handles {
            Self::collect(handle, &mut summary).await;
        }
        info!(
            "调度结束: 完成 {}，失败 {}，暂停 {}",
            summary.completed, summary.failed, summary.paused
        );
        Ok(summary)
    }

    async fn collect(handle: DownloadHandle, summary: &mut RunSummary) {
        let id = handle.queue_id().to_string();
        match handle.join().await {
            Ok(outcome) => summary.record(&outcome),
            Err(e) => {
                error!("下载任务 {} 结束时出错: {}", id, e);
                summary.errors += 1;
            }
        }
    }
}
