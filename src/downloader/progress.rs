//! 进度事件流: 下载任务 → 有界队列 → 转发任务 → 广播器。
//!
//! 队列满时直接丢弃新事件。持久化的进度才是权威数据，事件流只用于界面展示。

use std::sync::Arc;

use dashmap::DashMap;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::queue::models::QueueItem;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub queue_id: String,
    pub downloaded_size: u64,
    pub total_size: u64,
    pub chunks_completed: u32,
    pub chunks_total: u32,
    pub speed_bytes_per_sec: u64,
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProgressEvent {
    pub fn downloading(
        item: &QueueItem,
        downloaded_size: u64,
        chunks_completed: u32,
        speed: u64,
    ) -> Self {
        Self {
            queue_id: item.id.clone(),
            downloaded_size,
            total_size: item.total_size,
            chunks_completed,
            chunks_total: item.chunks_total,
            speed_bytes_per_sec: speed,
            status: ProgressStatus::Downloading,
            error_message: None,
        }
    }

    pub fn completed(item: &QueueItem) -> Self {
        Self {
            queue_id: item.id.clone(),
            downloaded_size: item.total_size,
            total_size: item.total_size,
            chunks_completed: item.chunks_total,
            chunks_total: item.chunks_total,
            speed_bytes_per_sec: 0,
            status: ProgressStatus::Completed,
            error_message: None,
        }
    }

    pub fn failed(item: &QueueItem, downloaded_size: u64, chunks_completed: u32, message: String) -> Self {
        Self {
            queue_id: item.id.clone(),
            downloaded_size,
            total_size: item.total_size,
            chunks_completed,
            chunks_total: item.chunks_total,
            speed_bytes_per_sec: 0,
            status: ProgressStatus::Failed,
            error_message: Some(message),
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            return if self.status == ProgressStatus::Completed { 100.0 } else { 0.0 };
        }
        self.downloaded_size as f64 / self.total_size as f64 * 100.0
    }
}

/// 进度事件的消费方（例如 WebSocket 推送、终端进度条）
pub trait ProgressBroadcaster: Send + Sync {
    fn broadcast(&self, event: &ProgressEvent);
}

/// 有界、非阻塞的进度事件发送端，可被多个下载任务共享
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// 发送事件，队列满或接收端已关闭时丢弃，返回是否送达队列
    pub fn emit(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                trace!("进度队列已满，丢弃事件: {}", event.queue_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// 启动转发任务，直到所有发送端都被释放
pub fn spawn_forwarder(
    mut rx: mpsc::Receiver<ProgressEvent>,
    broadcaster: Arc<dyn ProgressBroadcaster>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            broadcaster.broadcast(&event);
        }
        debug!("进度转发任务结束");
    })
}

/// 基于 tokio broadcast 的多订阅者分发
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressBroadcaster for ChannelBroadcaster {
    fn broadcast(&self, event: &ProgressEvent) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.tx.send(event.clone());
    }
}

/// 终端多进度条显示
pub struct ConsoleProgress {
    multi_pb: MultiProgress,
    bars: DashMap<String, ProgressBar>,
    labels: DashMap<String, String>,
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            multi_pb: MultiProgress::new(),
            bars: DashMap::new(),
            labels: DashMap::new(),
        }
    }

    /// 为队列项设置进度条上显示的名称
    pub fn set_label(&self, queue_id: &str, label: impl Into<String>) {
        self.labels.insert(queue_id.to_string(), label.into());
    }

    fn bar_for(&self, event: &ProgressEvent) -> ProgressBar {
        self.bars
            .entry(event.queue_id.clone())
            .or_insert_with(|| {
                let pb = self.multi_pb.add(ProgressBar::new(event.total_size));
                pb.set_style(
                    ProgressStyle::with_template(
                        "{msg:20!} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
                );
                let label = self
                    .labels
                    .get(&event.queue_id)
                    .map(|l| l.value().clone())
                    .unwrap_or_else(|| event.queue_id.chars().take(8).collect());
                pb.set_message(label);
                pb
            })
            .value()
            .clone()
    }
}

impl ProgressBroadcaster for ConsoleProgress {
    fn broadcast(&self, event: &ProgressEvent) {
        let pb = self.bar_for(event);
        pb.set_length(event.total_size);
        pb.set_position(event.downloaded_size);
        match event.status {
            ProgressStatus::Downloading => {}
            ProgressStatus::Completed => {
                pb.finish();
                self.bars.remove(&event.queue_id);
            }
            ProgressStatus::Failed => {
                pb.abandon();
                self.bars.remove(&event.queue_id);
            }
        }
    }
}
