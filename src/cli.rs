use clap::{Parser, Subcommand};
use std::path::PathBuf;

use queue_downloader::QueueStatus;

/// 视频下载队列
#[derive(Parser, Debug)]
#[command(name = "qdl")]
#[command(version = "1.0")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "支持分块、断点续传和失败重试的视频下载队列", long_about = None)]
pub struct Cli {
    /// 配置文件 (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// 队列状态文件
    #[arg(long, global = true, value_name = "FILE")]
    #[arg(default_value = "queue_state.bin")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub state_file: PathBuf,

    /// 视频保存目录 (覆盖配置文件)
    #[arg(long, global = true, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub download_dir: Option<PathBuf>,

    /// 分块大小 (字节)
    #[arg(long, global = true, value_name = "BYTES")]
    pub chunk_size: Option<u64>,

    /// 同时下载的数量
    #[arg(long, global = true, value_name = "N")]
    pub concurrency: Option<usize>,

    /// 最大重试次数
    #[arg(long, global = true, value_name = "N")]
    pub max_retries: Option<u32>,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 添加视频到下载队列
    Add {
        /// 视频下载地址
        #[arg(long, value_name = "URL", required_unless_present = "from_file")]
        #[arg(value_hint = clap::ValueHint::Url)]
        url: Option<String>,

        /// 视频标题
        #[arg(long, default_value = "未命名视频")]
        title: String,

        /// 作者
        #[arg(long, default_value = "未知作者")]
        author: String,

        #[arg(long, default_value = "")]
        video_id: String,

        #[arg(long, default_value = "")]
        cover_url: String,

        #[arg(long, default_value = "")]
        resolution: String,

        /// 时长 (秒)
        #[arg(long, default_value_t = 0)]
        duration: u64,

        /// 文件大小 (字节)，不指定时通过 HEAD 请求获取
        #[arg(long, value_name = "BYTES")]
        size: Option<u64>,

        /// 从 JSON 文件批量导入 (视频信息数组)
        #[arg(long, value_name = "FILE", conflicts_with = "url")]
        #[arg(value_hint = clap::ValueHint::FilePath)]
        from_file: Option<PathBuf>,
    },

    /// 查看队列
    List {
        /// 只显示指定状态: pending, downloading, paused, completed, failed
        #[arg(long)]
        status: Option<QueueStatus>,
    },

    /// 队列统计
    Stats,

    /// 下载历史
    History,

    /// 从队列删除 (不会删除已下载的文件)
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// 清空队列
    Clear,

    /// 按给定顺序重新排列优先级
    Reorder {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// 恢复已暂停的下载并立即开始
    Resume {
        /// 队列项 ID，不指定时恢复全部
        id: Option<String>,
    },

    /// 重试失败的下载并立即开始
    Retry { id: String },

    /// 按优先级下载队列中的所有等待项
    Run {
        /// 开始前先恢复所有已暂停的下载
        #[arg(long)]
        resume_paused: bool,
    },
}
