use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::downloader::chunk::chunk_count;

// --------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Downloading,
        QueueStatus::Paused,
        QueueStatus::Completed,
        QueueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Downloading => "downloading",
            QueueStatus::Paused => "paused",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| format!("未知的状态: {}", s))
    }
}

// --------------------------------------------------------------------

/// 待加入队列的视频信息（由流量抓取一侧提供）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewVideo {
    pub video_id: String,
    pub title: String,
    pub author: String,
    pub cover_url: String,
    pub video_url: String,
    pub decrypt_key: Option<String>,
    pub duration: u64, // 秒
    pub resolution: String,
    pub total_size: u64,
}

/// 队列中的一个下载项，持久化保存
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    pub id: String,
    pub video_id: String,
    pub title: String,
    pub author: String,
    pub cover_url: String,
    pub video_url: String,
    pub decrypt_key: Option<String>,
    pub duration: u64,
    pub resolution: String,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: QueueStatus,
    pub priority: i64,
    pub added_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub speed: u64, // 字节/秒
    pub chunk_size: u64,
    pub chunks_total: u32,
    pub chunks_completed: u32,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn from_video(video: NewVideo, chunk_size: u64, priority: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            video_id: video.video_id,
            title: video.title,
            author: video.author,
            cover_url: video.cover_url,
            video_url: video.video_url,
            decrypt_key: video.decrypt_key,
            duration: video.duration,
            resolution: video.resolution,
            total_size: video.total_size,
            downloaded_size: 0,
            status: QueueStatus::Pending,
            priority,
            added_time: now,
            start_time: None,
            speed: 0,
            chunk_size,
            // 分块数溢出的视频在加入队列时已被拒绝
            chunks_total: chunk_count(video.total_size, chunk_size).unwrap_or(u32::MAX),
            chunks_completed: 0,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 已下载百分比（0-100）
    pub fn percent(&self) -> f64 {
        if self.total_size == 0 {
            if self.status == QueueStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            self.downloaded_size as f64 / self.total_size as f64 * 100.0
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 已完成下载的历史记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: String,
    pub queue_id: String,
    pub video_id: String,
    pub title: String,
    pub author: String,
    pub cover_url: String,
    pub duration: u64,
    pub resolution: String,
    pub file_size: u64,
    pub file_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
}

/// 按状态统计的队列数量，每次查询时实时计算
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub(crate) fn set(&mut self, status: QueueStatus, count: usize) {
        match status {
            QueueStatus::Pending => self.pending = count,
            QueueStatus::Downloading => self.downloading = count,
            QueueStatus::Paused => self.paused = count,
            QueueStatus::Completed => self.completed = count,
            QueueStatus::Failed => self.failed = count,
        }
    }
}
