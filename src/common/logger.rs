use colored::*;

use crate::queue::models::{QueueItem, QueueStats, QueueStatus};

/// 初始化 tracing 日志输出
pub fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

/// 漂亮的终端输出工具
pub struct PrettyLogger;

impl PrettyLogger {
    /// 显示成功消息
    pub fn success(message: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), message.as_ref());
    }

    /// 显示信息消息
    pub fn info(message: impl AsRef<str>) {
        println!("{} {}", "ℹ".blue().bold(), message.as_ref());
    }

    /// 显示警告消息
    pub fn warning(message: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow().bold(), message.as_ref());
    }

    /// 显示错误消息
    pub fn error(message: impl AsRef<str>) {
        println!("{} {}", "✗".red().bold(), message.as_ref());
    }

    /// 显示分割线
    pub fn separator() {
        println!("{}", "─".repeat(50).bright_black());
    }

    /// 显示标题
    pub fn title(text: impl AsRef<str>) {
        let text = text.as_ref();
        let width = text.chars().count().min(48);
        let padding = (48 - width) / 2;
        println!(
            "{} {} {}",
            "─".repeat(padding).bright_black(),
            text.bold(),
            "─".repeat(48 - padding - width).bright_black()
        );
    }

    /// 显示一个队列项
    pub fn queue_item(item: &QueueItem) {
        let status = match item.status {
            QueueStatus::Pending => "pending".normal(),
            QueueStatus::Downloading => "downloading".cyan(),
            QueueStatus::Paused => "paused".yellow(),
            QueueStatus::Completed => "completed".green(),
            QueueStatus::Failed => "failed".red(),
        };
        println!(
            "{} [{}] {} - {} ({:.1}%, {}/{} 块, 优先级 {}, 重试 {})",
            "🎬".magenta().bold(),
            status,
            item.author.bold(),
            item.title,
            item.percent(),
            item.chunks_completed,
            item.chunks_total,
            item.priority,
            item.retry_count,
        );
        println!("   {} {}", "id:".bright_black(), item.id.bright_black());
        if let Some(message) = &item.error_message {
            println!("   {} {}", "错误:".red(), message);
        }
    }

    /// 显示队列统计
    pub fn stats(stats: &QueueStats) {
        Self::title("队列统计");
        println!("  总数: {}", stats.total.to_string().bold());
        println!("  等待: {}", stats.pending);
        println!("  下载中: {}", stats.downloading.to_string().cyan());
        println!("  已暂停: {}", stats.paused.to_string().yellow());
        println!("  已完成: {}", stats.completed.to_string().green());
        println!("  失败: {}", stats.failed.to_string().red());
    }

    /// 显示文件信息
    pub fn file_info(label: impl AsRef<str>, path: impl AsRef<str>) {
        println!("{} {}: {}", "📁".blue().bold(), label.as_ref().bold(), path.as_ref());
    }

    /// 显示完成总结
    pub fn completion_summary(items: Vec<impl AsRef<str>>) {
        println!("\n{}", "🎉 队列处理完成！".green().bold());
        for item in items {
            println!("  {}", item.as_ref());
        }
    }
}
