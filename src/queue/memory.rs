use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::models::{HistoryRecord, QueueItem, QueueStatus};
use super::store::{HistoryStore, QueueStore, StoreError, StoreResult, scheduling_order};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredItem {
    seq: u64, // 插入顺序，用于同一时刻加入的记录排序
    item: QueueItem,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    items: HashMap<String, StoredItem>,
    history: Vec<HistoryRecord>,
    next_seq: u64,
}

impl StoreState {
    fn sorted(&self, filter: impl Fn(&QueueItem) -> bool) -> Vec<QueueItem> {
        let mut stored: Vec<&StoredItem> = self.items.values().filter(|s| filter(&s.item)).collect();
        stored.sort_by(|a, b| scheduling_order(&a.item, &b.item).then(a.seq.cmp(&b.seq)));
        stored.into_iter().map(|s| s.item.clone()).collect()
    }
}

/// 内存存储，可选地在每次修改后把快照写入状态文件（bincode 编码）
pub struct MemoryStore {
    state: RwLock<StoreState>,
    state_file: Option<PathBuf>,
    file_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// 纯内存存储，不落盘
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            state_file: None,
            file_lock: Mutex::new(()),
        }
    }

    /// 打开状态文件，不存在时创建空存储
    pub async fn open(state_file: impl AsRef<Path>) -> StoreResult<Self> {
        let state_file = state_file.as_ref().to_path_buf();
        let state = if tokio::fs::try_exists(&state_file).await? {
            let data = tokio::fs::read(&state_file).await?;
            let (state, _): (StoreState, usize) =
                bincode::serde::decode_from_slice(&data, bincode::config::standard())
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
            info!(
                "已加载状态文件 {}: {} 个队列项, {} 条历史",
                state_file.display(),
                state.items.len(),
                state.history.len()
            );
            state
        } else {
            if let Some(parent) = state_file.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            debug!("状态文件不存在，创建新的存储: {}", state_file.display());
            StoreState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            state_file: Some(state_file),
            file_lock: Mutex::new(()),
        })
    }

    // 保存当前状态到磁盘
    async fn persist(&self) -> StoreResult<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        // 先拿文件锁再取快照，保证后取的快照一定后写入
        let _guard = self.file_lock.lock().await;
        let data = {
            let state = self.state.read().await;
            bincode::serde::encode_to_vec(&*state, bincode::config::standard())
                .map_err(|e| StoreError::Encode(e.to_string()))?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn modify<T>(&self, id: &str, f: impl FnOnce(&mut QueueItem) -> T) -> StoreResult<T> {
        let result = {
            let mut state = self.state.write().await;
            let stored = state
                .items
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let result = f(&mut stored.item);
            stored.item.touch();
            result
        };
        self.persist().await?;
        Ok(result)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn add(&self, item: QueueItem) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            if state.items.contains_key(&item.id) {
                return Err(StoreError::Duplicate(item.id));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.items.insert(item.id.clone(), StoredItem { seq, item });
        }
        self.persist().await
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<QueueItem>> {
        let state = self.state.read().await;
        Ok(state.items.get(id).map(|s| s.item.clone()))
    }

    async fn update(&self, item: &QueueItem) -> StoreResult<()> {
        let id = item.id.clone();
        let item = item.clone();
        self.modify(&id, move |stored| *stored = item).await
    }

    async fn remove(&self, id: &str) -> StoreResult<bool> {
        let removed = self.state.write().await.items.remove(id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn remove_many(&self, ids: &[String]) -> StoreResult<usize> {
        let removed = {
            let mut state = self.state.write().await;
            ids.iter()
                .filter(|id| state.items.remove(id.as_str()).is_some())
                .count()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn clear(&self) -> StoreResult<()> {
        self.state.write().await.items.clear();
        self.persist().await
    }

    async fn list(&self) -> StoreResult<Vec<QueueItem>> {
        Ok(self.state.read().await.sorted(|_| true))
    }

    async fn list_by_status(&self, status: QueueStatus) -> StoreResult<Vec<QueueItem>> {
        Ok(self.state.read().await.sorted(|item| item.status == status))
    }

    async fn update_status(&self, id: &str, status: QueueStatus) -> StoreResult<()> {
        self.modify(id, |item| item.status = status).await
    }

    async fn update_progress(
        &self,
        id: &str,
        downloaded_size: u64,
        chunks_completed: u32,
        speed: u64,
    ) -> StoreResult<()> {
        self.modify(id, |item| {
            item.downloaded_size = downloaded_size;
            item.chunks_completed = chunks_completed;
            item.speed = speed;
        })
        .await
    }

    async fn reorder(&self, ids: &[String]) -> StoreResult<()> {
        {
            let mut state = self.state.write().await;
            if let Some(missing) = ids.iter().find(|id| !state.items.contains_key(id.as_str())) {
                return Err(StoreError::NotFound(missing.clone()));
            }
            let total = ids.len() as i64;
            let now = Utc::now();
            for (index, id) in ids.iter().enumerate() {
                if let Some(stored) = state.items.get_mut(id.as_str()) {
                    stored.item.priority = total - index as i64;
                    stored.item.updated_at = now;
                }
            }
        }
        self.persist().await
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.state.read().await.items.len())
    }

    async fn count_by_status(&self, status: QueueStatus) -> StoreResult<usize> {
        let state = self.state.read().await;
        Ok(state.items.values().filter(|s| s.item.status == status).count())
    }

    async fn get_next_pending(&self) -> StoreResult<Option<QueueItem>> {
        let state = self.state.read().await;
        Ok(state
            .items
            .values()
            .filter(|s| s.item.status == QueueStatus::Pending)
            .min_by(|a, b| scheduling_order(&a.item, &b.item).then(a.seq.cmp(&b.seq)))
            .map(|s| s.item.clone()))
    }

    async fn increment_retry_count(&self, id: &str) -> StoreResult<u32> {
        self.modify(id, |item| {
            item.retry_count += 1;
            item.retry_count
        })
        .await
    }

    async fn set_start_time(&self, id: &str, start_time: DateTime<Utc>) -> StoreResult<()> {
        self.modify(id, |item| item.start_time = Some(start_time)).await
    }

    async fn set_error(&self, id: &str, message: Option<String>) -> StoreResult<()> {
        self.modify(id, |item| item.error_message = message).await
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn add_history(&self, record: HistoryRecord) -> StoreResult<()> {
        self.state.write().await.history.push(record);
        self.persist().await
    }

    async fn list_history(&self) -> StoreResult<Vec<HistoryRecord>> {
        let mut history = self.state.read().await.history.clone();
        history.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        Ok(history)
    }

    async fn history_by_queue_id(&self, queue_id: &str) -> StoreResult<Vec<HistoryRecord>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|r| r.queue_id == queue_id)
            .cloned()
            .collect())
    }
}
