use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::{debug, info, warn};

use queue_downloader::common::client::DownloadClient;
use queue_downloader::common::logger::{PrettyLogger, init_tracing};
use queue_downloader::downloader::progress::ConsoleProgress;
use queue_downloader::{
    ChunkedDownloader, DownloadHandle, DownloadManager, DownloadOutcome, DownloadError,
    MemoryStore, NewVideo, QueueManager, QueueStatus, Settings,
};

mod cli;

use cli::{Cli, Command};

/// 配置文件 + 命令行覆盖
fn load_settings(args: &Cli) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("加载配置文件失败: {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(dir) = &args.download_dir {
        settings.download_dir = dir.clone();
    }
    if let Some(chunk_size) = args.chunk_size {
        settings.chunk_size = chunk_size;
    }
    if let Some(concurrency) = args.concurrency {
        settings.concurrent_limit = concurrency;
    }
    if let Some(max_retries) = args.max_retries {
        settings.max_retries = max_retries;
    }
    settings.validate()?;
    debug!("运行配置: {:?}", settings);
    Ok(settings)
}

/// 打开持久化队列，并把上次中断的下载转为暂停
async fn open_queue(args: &Cli, settings: Settings) -> Result<Arc<QueueManager>> {
    let store = MemoryStore::open(&args.state_file)
        .await
        .with_context(|| format!("打开队列状态文件失败: {}", args.state_file.display()))?;
    let queue = Arc::new(QueueManager::from_store(Arc::new(store), Arc::new(settings)));
    let recovered = queue.recover_interrupted().await?;
    if !recovered.is_empty() {
        warn!("{} 个下载在上次退出时被中断，已转为暂停", recovered.len());
    }
    Ok(queue)
}

async fn build_engine(queue: &Arc<QueueManager>) -> Result<Arc<ChunkedDownloader>> {
    let client = DownloadClient::new(queue.settings())?;
    let console = Arc::new(ConsoleProgress::new());
    for item in queue.list().await? {
        console.set_label(&item.id, item.title.clone());
    }
    Ok(Arc::new(ChunkedDownloader::new(queue.clone(), client, console)))
}

async fn handle_add(queue: &QueueManager, command: Command) -> Result<()> {
    let Command::Add {
        url,
        title,
        author,
        video_id,
        cover_url,
        resolution,
        duration,
        size,
        from_file,
    } = command
    else {
        return Ok(());
    };

    let mut videos: Vec<NewVideo> = match from_file {
        Some(path) => {
            let data = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("读取文件失败: {}", path.display()))?;
            serde_json::from_str(&data).context("解析视频列表失败")?
        }
        None => vec![NewVideo {
            video_id,
            title,
            author,
            cover_url,
            video_url: url.unwrap_or_default(),
            decrypt_key: None,
            duration,
            resolution,
            total_size: size.unwrap_or(0),
        }],
    };

    // 未提供大小的视频并发发送 HEAD 请求
    let client = DownloadClient::new(queue.settings())?;
    let sizes = futures::future::join_all(videos.iter().map(|video| {
        let client = &client;
        async move {
            if video.total_size > 0 {
                Ok(video.total_size)
            } else {
                client.probe_size(&video.video_url).await
            }
        }
    }))
    .await;
    for (video, size) in videos.iter_mut().zip(sizes) {
        video.total_size =
            size.with_context(|| format!("获取文件大小失败: {}", video.video_url))?;
    }

    let added = queue.add_to_queue(videos).await?;
    PrettyLogger::success(format!("已添加 {} 个视频到下载队列", added.len()));
    for item in &added {
        PrettyLogger::queue_item(item);
    }
    Ok(())
}

async fn handle_list(queue: &QueueManager, status: Option<QueueStatus>) -> Result<()> {
    let items = match status {
        Some(status) => queue.list_by_status(status).await?,
        None => queue.list().await?,
    };
    if items.is_empty() {
        PrettyLogger::info("队列为空");
        return Ok(());
    }
    PrettyLogger::title("下载队列");
    for item in &items {
        PrettyLogger::queue_item(item);
    }
    Ok(())
}

async fn handle_history(queue: &QueueManager) -> Result<()> {
    let records = queue.history().await?;
    if records.is_empty() {
        PrettyLogger::info("暂无下载历史");
        return Ok(());
    }
    PrettyLogger::title("下载历史");
    for record in &records {
        PrettyLogger::file_info(
            format!(
                "{} - {} ({})",
                record.author,
                record.title,
                record.downloaded_at.format("%Y-%m-%d %H:%M:%S")
            ),
            record.file_path.display().to_string(),
        );
    }
    Ok(())
}

/// 等待下载结束，Ctrl+C 时暂停所有下载并保留断点
async fn wait_for(downloader: &ChunkedDownloader, handles: Vec<DownloadHandle>) -> Result<()> {
    let mut joined = Box::pin(futures::future::join_all(
        handles.into_iter().map(|handle| handle.join()),
    ));
    let results = tokio::select! {
        results = &mut joined => results,
        _ = tokio::signal::ctrl_c() => {
            PrettyLogger::warning("收到中断信号，正在暂停下载...");
            downloader.shutdown().await;
            joined.await
        }
    };

    let mut finished = Vec::new();
    for result in results {
        match result {
            Ok(DownloadOutcome::Completed(Some(record))) => {
                finished.push(record.file_path.display().to_string());
            }
            Ok(DownloadOutcome::Completed(None)) => {}
            Ok(DownloadOutcome::Paused) => PrettyLogger::warning("下载已暂停，可稍后恢复"),
            Ok(DownloadOutcome::Cancelled) => PrettyLogger::warning("下载已取消"),
            Ok(DownloadOutcome::Failed(message)) => {
                PrettyLogger::error(format!("下载失败: {}", message))
            }
            Err(e) => PrettyLogger::error(format!("下载任务出错: {}", e)),
        }
    }
    if !finished.is_empty() {
        PrettyLogger::completion_summary(finished);
    }
    Ok(())
}

async fn handle_run(queue: &Arc<QueueManager>, resume_paused: bool) -> Result<()> {
    let downloader = build_engine(queue).await?;
    let manager = DownloadManager::new(downloader.clone());

    let token = manager.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            PrettyLogger::warning("收到中断信号，正在暂停下载...");
            token.cancel();
        }
    });

    if resume_paused {
        // 转回等待状态，由调度器按优先级启动
        for item in queue.list_by_status(QueueStatus::Paused).await? {
            queue.resume(&item.id).await?;
        }
    }

    let summary = manager.run_until_idle().await?;
    PrettyLogger::separator();
    info!(
        "完成 {} 个，失败 {} 个，暂停 {} 个",
        summary.completed, summary.failed, summary.paused
    );
    PrettyLogger::stats(&queue.stats().await?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let settings = load_settings(&args)?;
    let queue = open_queue(&args, settings).await?;

    match args.command {
        command @ Command::Add { .. } => handle_add(&queue, command).await?,
        Command::List { status } => handle_list(&queue, status).await?,
        Command::Stats => PrettyLogger::stats(&queue.stats().await?),
        Command::History => handle_history(&queue).await?,
        Command::Remove { ids } => {
            let removed = queue.remove_many(&ids).await?;
            PrettyLogger::success(format!("已删除 {} 个队列项", removed));
        }
        Command::Clear => {
            queue.clear().await?;
            PrettyLogger::success("队列已清空");
        }
        Command::Reorder { ids } => {
            queue.reorder(&ids).await?;
            PrettyLogger::success("队列顺序已更新");
        }
        Command::Resume { id } => {
            let downloader = build_engine(&queue).await?;
            let handles = match id {
                Some(id) => vec![downloader.resume(&id).await?],
                None => {
                    let report = downloader.resume_all_paused().await?;
                    for (id, e) in &report.failed {
                        PrettyLogger::error(format!("恢复 {} 失败: {}", id, e));
                    }
                    report.started
                }
            };
            if handles.is_empty() {
                PrettyLogger::info("没有可恢复的下载");
            }
            wait_for(&downloader, handles).await?;
        }
        Command::Retry { id } => {
            let downloader = build_engine(&queue).await?;
            match downloader.retry(&id).await {
                Ok(handle) => wait_for(&downloader, vec![handle]).await?,
                Err(e @ DownloadError::RetryLimitReached { .. }) => {
                    PrettyLogger::error(e.to_string());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Run { resume_paused } => handle_run(&queue, resume_paused).await?,
    }

    info!("{}", "完成".green());
    Ok(())
}
