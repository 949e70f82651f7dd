use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, error, info, warn};

use super::chunk::{chunk_range, resume_offset};
use super::error::{DownloadError, Result};
use super::progress::{ProgressEvent, ProgressSender};
use super::retry::{RetryError, RetryPolicy, retry_with_backoff};
use super::task::{DownloadState, SpeedMeter};
use crate::common::client::DownloadClient;
use crate::queue::QueueManager;
use crate::queue::error::QueueError;
use crate::queue::models::{HistoryRecord, QueueItem, QueueStatus};

/// 一次执行的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    /// 首次完成时带有新写入的历史记录
    Completed(Option<HistoryRecord>),
    Paused,
    Cancelled,
    Failed(String),
}

/// 单个队列项一次执行所需的全部上下文
pub(crate) struct ItemRun {
    pub item: QueueItem,
    pub path: PathBuf,
    pub client: DownloadClient,
    pub queue: Arc<QueueManager>,
    pub progress: ProgressSender,
    pub policy: RetryPolicy,
    pub state: DownloadState,
}

/// 执行下载并写入终态。
///
/// 暂停/取消不写任何状态（暂停由调用方持久化）；完成和失败的状态写入出错时
/// 通过返回值向上传递。
pub(crate) async fn run_item(
    run: ItemRun,
    active: Arc<DashMap<String, DownloadState>>,
) -> Result<DownloadOutcome> {
    let id = run.item.id.clone();
    let generation = run.state.generation;
    info!("开始下载任务: {} ({}/{} 块已完成)", run.item.title, run.item.chunks_completed, run.item.chunks_total);

    let result = transfer(&run).await;
    // 只删除属于本次执行的登记，暂停后立即恢复产生的新执行不受影响
    active.remove_if(&id, |_, state| state.generation == generation);

    match result {
        // 最后一个分块写完时恰好被暂停: 保持暂停，恢复后没有剩余分块可下载
        Ok(()) if run.state.is_paused() => {
            debug!("下载在完成前被暂停: {}", id);
            Ok(DownloadOutcome::Paused)
        }
        Ok(()) => match run.queue.complete_download(&id).await {
            Ok(record) => {
                run.progress.emit(ProgressEvent::completed(&run.item));
                Ok(DownloadOutcome::Completed(record))
            }
            Err(QueueError::InvalidTransition {
                status: QueueStatus::Paused,
                ..
            }) => {
                debug!("下载在完成前被暂停: {}", id);
                Ok(DownloadOutcome::Paused)
            }
            Err(e) => Err(e.into()),
        },
        Err(DownloadError::Cancelled) => {
            if run.state.is_paused() {
                debug!("下载已暂停: {}", id);
                Ok(DownloadOutcome::Paused)
            } else {
                debug!("下载已取消: {}", id);
                Ok(DownloadOutcome::Cancelled)
            }
        }
        // 暂停已经持久化，和暂停同时到达的错误不再覆盖状态
        Err(e) if run.state.is_paused() => {
            debug!("暂停期间的下载错误被忽略: {}, 错误: {}", id, e);
            Ok(DownloadOutcome::Paused)
        }
        Err(e) => {
            let message = e.to_string();
            error!("❌ 下载任务失败: {}, 错误: {}", id, message);
            let failed = run.queue.fail_download(&id, &message).await?;
            run.progress.emit(ProgressEvent::failed(
                &run.item,
                failed.downloaded_size,
                failed.chunks_completed,
                message.clone(),
            ));
            Ok(DownloadOutcome::Failed(message))
        }
    }
}

// 逐块下载并顺序写入文件，最后校验文件大小
async fn transfer(run: &ItemRun) -> Result<()> {
    let item = &run.item;
    let token = &run.state.cancel_token;

    if let Some(parent) = run.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&run.path)
        .await?;

    // 从持久化的断点恢复，文件截断到最后一个完整分块的边界
    let existing = file.metadata().await?.len();
    let mut cursor = item.chunks_completed.min(item.chunks_total);
    let mut offset = resume_offset(cursor, item.chunk_size);
    if existing < offset {
        warn!(
            "文件 {} 只有 {} 字节，少于断点 {} 字节，从头开始下载",
            run.path.display(),
            existing,
            offset
        );
        cursor = 0;
        offset = 0;
    }
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    run.state.cursor.store(cursor, Ordering::SeqCst);

    let mut written = offset;
    let mut meter = SpeedMeter::new(offset);
    run.progress
        .emit(ProgressEvent::downloading(item, written, cursor, 0));

    for index in cursor..item.chunks_total {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let range = chunk_range(index, item.chunk_size, item.total_size).ok_or(
            DownloadError::ChunkOutOfRange {
                index,
                total_size: item.total_size,
            },
        )?;

        let client = &run.client;
        let url = item.video_url.as_str();
        let bytes = retry_with_backoff(&run.policy, token, DownloadError::is_retryable, move || {
            client.fetch_range(url, range)
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => DownloadError::Cancelled,
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { attempts, last } => DownloadError::RetriesExhausted {
                attempts,
                source: Box::new(last),
            },
        })?;

        // 暂停后不再写入
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        file.write_all(&bytes).await?;
        written += bytes.len() as u64;

        let completed = index + 1;
        run.state.cursor.store(completed, Ordering::SeqCst);
        let speed = meter.update(written);
        run.state.speed.store(speed, Ordering::SeqCst);

        // 单个分块的进度写入失败不影响下载
        if let Err(e) = run
            .queue
            .update_progress(&item.id, written, completed, speed)
            .await
        {
            warn!("保存下载进度失败: {}, 错误: {}", item.id, e);
        }
        run.progress
            .emit(ProgressEvent::downloading(item, written, completed, speed));
        debug!("分块 {}/{} 完成: {}", completed, item.chunks_total, item.id);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let actual = tokio::fs::metadata(&run.path).await?.len();
    if actual != item.total_size {
        return Err(DownloadError::SizeMismatch {
            expected: item.total_size,
            actual,
        });
    }
    Ok(())
}
