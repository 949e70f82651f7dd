use std::sync::Arc;
use std::time::Duration;

use queue_downloader::common::client::DownloadClient;
use queue_downloader::downloader::progress::ChannelBroadcaster;
use queue_downloader::{
    ChunkedDownloader, DownloadError, DownloadManager, DownloadOutcome, MemoryStore, NewVideo,
    ProgressStatus, QueueError, QueueManager, QueueStatus, Settings,
};
use tempfile::TempDir;
use tokio::sync::Barrier;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHUNK: usize = 10;
const VIDEO_PATH: &str = "/video.mp4";

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn settings(dir: &TempDir, max_retries: u32) -> Settings {
    Settings {
        chunk_size: CHUNK as u64,
        concurrent_limit: 2,
        max_retries,
        download_dir: dir.path().to_path_buf(),
        initial_retry_delay_ms: 10,
        max_retry_delay_ms: 20,
        poll_interval_ms: 20,
        ..Default::default()
    }
}

struct Harness {
    queue: Arc<QueueManager>,
    downloader: Arc<ChunkedDownloader>,
    broadcaster: Arc<ChannelBroadcaster>,
}

fn harness(dir: &TempDir, max_retries: u32) -> Harness {
    let queue = Arc::new(QueueManager::from_store(
        Arc::new(MemoryStore::new()),
        Arc::new(settings(dir, max_retries)),
    ));
    let broadcaster = Arc::new(ChannelBroadcaster::new(256));
    let downloader = Arc::new(ChunkedDownloader::new(
        queue.clone(),
        DownloadClient::from_client(reqwest::Client::new()),
        broadcaster.clone(),
    ));
    Harness {
        queue,
        downloader,
        broadcaster,
    }
}

fn video(server: &MockServer, title: &str, size: usize) -> NewVideo {
    NewVideo {
        video_id: format!("vid-{}", title),
        title: title.to_string(),
        author: "作者".to_string(),
        video_url: format!("{}{}", server.uri(), VIDEO_PATH),
        total_size: size as u64,
        ..Default::default()
    }
}

fn chunk_mock(content: &[u8], index: usize) -> (String, ResponseTemplate) {
    let start = index * CHUNK;
    let end = (start + CHUNK).min(content.len()) - 1;
    let template = ResponseTemplate::new(206)
        .set_body_bytes(content[start..=end].to_vec())
        .insert_header(
            "Content-Range",
            format!("bytes {}-{}/{}", start, end, content.len()).as_str(),
        );
    (format!("bytes={}-{}", start, end), template)
}

async fn mount_chunk(server: &MockServer, content: &[u8], index: usize, expect: u64) {
    let (range, template) = chunk_mock(content, index);
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .and(header("Range", range.as_str()))
        .respond_with(template)
        .expect(expect)
        .mount(server)
        .await;
}

// 响应很慢的分块，用来让下载停在这里
async fn mount_slow_chunk(server: &MockServer, content: &[u8], index: usize) {
    let (range, template) = chunk_mock(content, index);
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .and(header("Range", range.as_str()))
        .respond_with(template.set_delay(Duration::from_secs(30)))
        .mount(server)
        .await;
}

async fn mount_all(server: &MockServer, content: &[u8]) {
    for index in 0..content.len().div_ceil(CHUNK) {
        mount_chunk(server, content, index, 1).await;
    }
}

async fn wait_for_chunks(queue: &QueueManager, id: &str, chunks: u32) {
    for _ in 0..500 {
        if queue.get(id).await.unwrap().chunks_completed >= chunks {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("等待分块 {} 超时", chunks);
}

#[tokio::test]
async fn downloads_every_chunk_into_an_identical_file() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(45);
    mount_all(&server, &content).await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "完整下载", 45)]).await.unwrap().remove(0);
    assert_eq!(item.chunks_total, 5);

    let outcome = h.downloader.start_download(&item).await.unwrap().join().await.unwrap();
    let DownloadOutcome::Completed(Some(record)) = outcome else {
        panic!("unexpected outcome: {:?}", outcome);
    };

    let written = tokio::fs::read(&record.file_path).await.unwrap();
    assert_eq!(written, content);
    assert_eq!(record.file_path, dir.path().join("作者").join("完整下载.mp4"));

    let stored = h.queue.get(&item.id).await.unwrap();
    assert_eq!(stored.status, QueueStatus::Completed);
    assert_eq!(stored.downloaded_size, 45);
    assert_eq!(stored.chunks_completed, 5);
    assert_eq!(h.queue.history().await.unwrap().len(), 1);
    assert!(!h.downloader.is_active(&item.id));
}

#[tokio::test]
async fn pause_keeps_checkpoint_and_resume_fetches_only_remaining_chunks() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(50);
    for index in 0..3 {
        mount_chunk(&server, &content, index, 1).await;
    }
    mount_slow_chunk(&server, &content, 3).await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "暂停", 50)]).await.unwrap().remove(0);
    let handle = h.downloader.start_download(&item).await.unwrap();

    wait_for_chunks(&h.queue, &item.id, 3).await;
    let paused = h.downloader.pause(&item.id).await.unwrap();
    assert_eq!(paused.status, QueueStatus::Paused);
    assert!(!h.downloader.is_active(&item.id));
    assert_eq!(handle.join().await.unwrap(), DownloadOutcome::Paused);

    let stored = h.queue.get(&item.id).await.unwrap();
    assert_eq!(stored.status, QueueStatus::Paused);
    assert_eq!(stored.chunks_completed, 3);
    assert_eq!(stored.downloaded_size, 30);
    let path = h.queue.output_path(&stored);
    assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 30);

    server.verify().await;
    server.reset().await;
    mount_chunk(&server, &content, 3, 1).await;
    mount_chunk(&server, &content, 4, 1).await;

    let outcome = h.downloader.resume(&item.id).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed(Some(_))));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), content);
}

#[tokio::test]
async fn starting_an_active_item_twice_is_rejected() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(20);
    mount_slow_chunk(&server, &content, 0).await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "重复", 20)]).await.unwrap().remove(0);
    let handle = h.downloader.start_download(&item).await.unwrap();

    let second = h.downloader.start_download(&item).await;
    assert!(matches!(second, Err(DownloadError::AlreadyActive(id)) if id == item.id));
    assert_eq!(h.downloader.active_count(), 1);
    assert_eq!(h.downloader.active_downloads()[0].queue_id, item.id);

    h.downloader.cancel(&item.id).unwrap();
    assert_eq!(handle.join().await.unwrap(), DownloadOutcome::Cancelled);
    assert!(matches!(
        h.downloader.cancel(&item.id),
        Err(DownloadError::NotActive(_))
    ));
}

#[tokio::test]
async fn short_body_fails_the_item_without_history() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(20);
    mount_chunk(&server, &content, 0, 1).await;
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .and(header("Range", "bytes=10-19"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(content[10..15].to_vec()))
        .mount(&server)
        .await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "不完整", 20)]).await.unwrap().remove(0);
    let outcome = h.downloader.start_download(&item).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Failed(_)));

    let stored = h.queue.get(&item.id).await.unwrap();
    assert_eq!(stored.status, QueueStatus::Failed);
    assert!(stored.error_message.unwrap().contains("文件大小不匹配"));
    assert!(h.queue.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn server_ignoring_range_fails_instead_of_corrupting_the_file() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(30);
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "无分块", 30)]).await.unwrap().remove(0);
    let outcome = h.downloader.start_download(&item).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Failed(_)));

    let stored = h.queue.get(&item.id).await.unwrap();
    assert_eq!(stored.status, QueueStatus::Failed);
    assert_eq!(stored.chunks_completed, 0);
}

#[tokio::test]
async fn transient_server_errors_are_retried_with_backoff() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(20);
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .and(header("Range", "bytes=0-9"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_all(&server, &content).await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "重试", 20)]).await.unwrap().remove(0);
    let outcome = h.downloader.start_download(&item).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed(Some(_))));

    let stored = h.queue.get(&item.id).await.unwrap();
    // 分块级重试不计入队列项的重试次数
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn retry_continues_a_failed_item_from_its_checkpoint() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(50);
    mount_chunk(&server, &content, 0, 1).await;
    mount_chunk(&server, &content, 1, 1).await;
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .and(header("Range", "bytes=20-29"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "失败重试", 50)]).await.unwrap().remove(0);
    let outcome = h.downloader.start_download(&item).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Failed(_)));
    let failed = h.queue.get(&item.id).await.unwrap();
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.chunks_completed, 2);

    server.verify().await;
    server.reset().await;
    for index in 2..5 {
        mount_chunk(&server, &content, index, 1).await;
    }

    let outcome = h.downloader.retry(&item.id).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed(Some(_))));

    let stored = h.queue.get(&item.id).await.unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.error_message, None);
    let written = tokio::fs::read(h.queue.output_path(&stored)).await.unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn retry_is_refused_at_the_limit_and_for_items_that_did_not_fail() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(&dir, 0);
    let items = h
        .queue
        .add_to_queue(vec![video(&server, "a", 20), video(&server, "b", 20)])
        .await
        .unwrap();

    let outcome = h.downloader.start_download(&items[0]).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Failed(_)));
    assert!(matches!(
        h.downloader.retry(&items[0].id).await,
        Err(DownloadError::RetryLimitReached { retry_count: 0, max_retries: 0, .. })
    ));
    assert!(matches!(
        h.downloader.retry(&items[1].id).await,
        Err(DownloadError::NotRetryable { status: QueueStatus::Pending, .. })
    ));
}

#[tokio::test]
async fn pausing_a_pending_item_is_an_invalid_transition() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "等待", 20)]).await.unwrap().remove(0);

    let result = h.downloader.pause(&item.id).await;
    assert!(matches!(
        result,
        Err(DownloadError::Queue(QueueError::InvalidTransition { .. }))
    ));
    assert_eq!(h.queue.get(&item.id).await.unwrap().status, QueueStatus::Pending);
}

#[tokio::test]
async fn missing_partial_file_restarts_from_the_first_chunk() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(30);
    mount_all(&server, &content).await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "丢失", 30)]).await.unwrap().remove(0);
    // 有断点但文件不存在
    h.queue.update_progress(&item.id, 20, 2, 0).await.unwrap();
    let item = h.queue.get(&item.id).await.unwrap();

    let outcome = h.downloader.start_download(&item).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed(Some(_))));
    assert_eq!(tokio::fs::read(h.queue.output_path(&item)).await.unwrap(), content);
}

#[tokio::test]
async fn progress_events_reach_subscribers_in_order() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(40);
    mount_all(&server, &content).await;

    let h = harness(&dir, 3);
    let mut events = h.broadcaster.subscribe();
    let item = h.queue.add_to_queue(vec![video(&server, "进度", 40)]).await.unwrap().remove(0);
    h.downloader.start_download(&item).await.unwrap().join().await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let done = event.status == ProgressStatus::Completed;
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(seen.windows(2).all(|w| w[0].chunks_completed <= w[1].chunks_completed));
    let last = seen.last().unwrap();
    assert_eq!(last.queue_id, item.id);
    assert_eq!(last.downloaded_size, 40);
    assert_eq!(last.percent(), 100.0);
}

#[tokio::test]
async fn scheduler_downloads_everything_then_goes_idle() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(20);
    for index in 0..2 {
        mount_chunk(&server, &content, index, 3).await;
    }

    let h = harness(&dir, 3);
    h.queue
        .add_to_queue(vec![
            video(&server, "一", 20),
            video(&server, "二", 20),
            video(&server, "三", 20),
        ])
        .await
        .unwrap();

    let manager = DownloadManager::new(h.downloader.clone());
    let summary = tokio::time::timeout(Duration::from_secs(10), manager.run_until_idle())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(h.queue.history().await.unwrap().len(), 3);
}

#[tokio::test]
async fn shutdown_pauses_active_downloads_and_refuses_new_ones() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(20);
    mount_slow_chunk(&server, &content, 0).await;

    let h = harness(&dir, 3);
    let items = h
        .queue
        .add_to_queue(vec![video(&server, "关闭", 20), video(&server, "之后", 20)])
        .await
        .unwrap();
    let handle = h.downloader.start_download(&items[0]).await.unwrap();

    h.downloader.shutdown().await;
    assert_eq!(handle.join().await.unwrap(), DownloadOutcome::Paused);
    assert_eq!(h.queue.get(&items[0].id).await.unwrap().status, QueueStatus::Paused);
    assert!(matches!(
        h.downloader.start_download(&items[1]).await,
        Err(DownloadError::Shutdown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_of_the_same_item_admit_exactly_one() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(20);
    mount_slow_chunk(&server, &content, 0).await;

    let h = harness(&dir, 3);
    let item = h.queue.add_to_queue(vec![video(&server, "并发启动", 20)]).await.unwrap().remove(0);

    let barrier = Arc::new(Barrier::new(2));
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let downloader = h.downloader.clone();
        let barrier = barrier.clone();
        let item = item.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            downloader.start_download(&item).await
        }));
    }

    let mut handles = Vec::new();
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(DownloadError::AlreadyActive(id)) => {
                assert_eq!(id, item.id);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(handles.len(), 1);
    assert_eq!(rejected, 1);
    assert_eq!(h.downloader.active_count(), 1);

    h.downloader.cancel(&item.id).unwrap();
    assert_eq!(handles.remove(0).join().await.unwrap(), DownloadOutcome::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_retries_start_a_single_run() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("GET"))
        .and(path(VIDEO_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(&dir, 1);
    let item = h.queue.add_to_queue(vec![video(&server, "并发重试", 20)]).await.unwrap().remove(0);
    let outcome = h.downloader.start_download(&item).await.unwrap().join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Failed(_)));

    let barrier = Arc::new(Barrier::new(4));
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let downloader = h.downloader.clone();
        let barrier = barrier.clone();
        let id = item.id.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            downloader.retry(&id).await
        }));
    }

    let mut handles = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(DownloadError::NotRetryable { .. } | DownloadError::RetryLimitReached { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(handles.len(), 1);
    let outcome = handles.remove(0).join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Failed(_)));

    let stored = h.queue.get(&item.id).await.unwrap();
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.status, QueueStatus::Failed);
    assert!(matches!(
        h.downloader.retry(&item.id).await,
        Err(DownloadError::RetryLimitReached { retry_count: 1, max_retries: 1, .. })
    ));
}

#[tokio::test]
async fn resume_all_paused_keeps_going_after_one_item_fails() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(20);
    mount_slow_chunk(&server, &content, 0).await;
    let other = body(CHUNK);
    Mock::given(method("GET"))
        .and(path("/other.mp4"))
        .and(header("Range", "bytes=0-9"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(other.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&dir, 3);
    let stuck = h.queue.add_to_queue(vec![video(&server, "仍在执行", 20)]).await.unwrap().remove(0);
    let stuck_handle = h.downloader.start_download(&stuck).await.unwrap();
    // 只在队列层暂停，执行仍然登记为活跃，恢复时会被拒绝
    h.queue.pause(&stuck.id).await.unwrap();

    let ready = NewVideo {
        video_url: format!("{}/other.mp4", server.uri()),
        ..video(&server, "可以恢复", CHUNK)
    };
    let ready = h.queue.add_to_queue(vec![ready]).await.unwrap().remove(0);
    h.queue.mark_downloading(&ready.id).await.unwrap();
    h.queue.pause(&ready.id).await.unwrap();

    let mut report = h.downloader.resume_all_paused().await.unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, stuck.id);
    assert!(matches!(report.failed[0].1, DownloadError::AlreadyActive(_)));
    assert_eq!(report.started.len(), 1);
    assert_eq!(report.started[0].queue_id(), ready.id);

    let outcome = report.started.remove(0).join().await.unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed(Some(_))));
    let stored = h.queue.get(&ready.id).await.unwrap();
    assert_eq!(tokio::fs::read(h.queue.output_path(&stored)).await.unwrap(), other);

    h.downloader.cancel(&stuck.id).unwrap();
    assert_eq!(stuck_handle.join().await.unwrap(), DownloadOutcome::Cancelled);
}

#[tokio::test]
async fn removing_items_leaves_their_partial_files_on_disk() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let content = body(30);
    mount_chunk(&server, &content, 0, 2).await;
    mount_slow_chunk(&server, &content, 1).await;

    let h = harness(&dir, 3);
    let items = h
        .queue
        .add_to_queue(vec![video(&server, "单个删除", 30), video(&server, "批量删除", 30)])
        .await
        .unwrap();
    let mut paths = Vec::new();
    for item in &items {
        let handle = h.downloader.start_download(item).await.unwrap();
        wait_for_chunks(&h.queue, &item.id, 1).await;
        h.downloader.pause(&item.id).await.unwrap();
        assert_eq!(handle.join().await.unwrap(), DownloadOutcome::Paused);
        paths.push(h.queue.output_path(item));
    }

    h.queue.remove_from_queue(&items[0].id).await.unwrap();
    assert_eq!(h.queue.remove_many(&[items[1].id.clone()]).await.unwrap(), 1);

    for (item, path) in items.iter().zip(&paths) {
        assert!(matches!(
            h.queue.get(&item.id).await,
            Err(QueueError::NotFound(_))
        ));
        assert_eq!(tokio::fs::metadata(path).await.unwrap().len(), CHUNK as u64);
    }
    server.verify().await;
}
