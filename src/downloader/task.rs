use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// 一个正在执行的下载的内存状态，从不持久化
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub queue_id: String,
    /// 每次启动分配新的编号，避免旧的执行删除新的登记
    pub generation: u64,
    pub cancel_token: CancellationToken,
    pub(crate) cursor: Arc<AtomicU32>,
    pub(crate) speed: Arc<AtomicU64>,
    pub(crate) paused: Arc<AtomicBool>,
    pub started_at: Instant,
}

impl DownloadState {
    pub fn new(queue_id: &str, generation: u64, cancel_token: CancellationToken, cursor: u32) -> Self {
        Self {
            queue_id: queue_id.to_string(),
            generation,
            cancel_token,
            cursor: Arc::new(AtomicU32::new(cursor)),
            speed: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn mark_paused(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            queue_id: self.queue_id.clone(),
            chunk_cursor: self.cursor.load(Ordering::SeqCst),
            speed_bytes_per_sec: self.speed.load(Ordering::SeqCst),
            paused: self.is_paused(),
            elapsed_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// 对外暴露的下载状态副本
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DownloadSnapshot {
    pub queue_id: String,
    pub chunk_cursor: u32,
    pub speed_bytes_per_sec: u64,
    pub paused: bool,
    pub elapsed_secs: u64,
}

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// 吞吐量估算: 至少间隔 1 秒采样一次，两次采样之间保持上一次的结果
#[derive(Debug)]
pub struct SpeedMeter {
    last_sample: Instant,
    last_bytes: u64,
    speed: u64,
}

impl SpeedMeter {
    pub fn new(start_bytes: u64) -> Self {
        Self::starting_at(Instant::now(), start_bytes)
    }

    fn starting_at(now: Instant, start_bytes: u64) -> Self {
        Self {
            last_sample: now,
            last_bytes: start_bytes,
            speed: 0,
        }
    }

    pub fn update(&mut self, total_bytes: u64) -> u64 {
        self.update_at(Instant::now(), total_bytes)
    }

    fn update_at(&mut self, now: Instant, total_bytes: u64) -> u64 {
        let elapsed = now.duration_since(self.last_sample);
        if elapsed >= SAMPLE_INTERVAL {
            let transferred = total_bytes.saturating_sub(self.last_bytes);
            self.speed = (transferred as f64 / elapsed.as_secs_f64()) as u64;
            self.last_sample = now;
            self.last_bytes = total_bytes;
        }
        self.speed
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }
}
