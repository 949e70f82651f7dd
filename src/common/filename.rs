use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("合法的正则表达式"));

/// 单个路径组件允许的最大字符数
const MAX_COMPONENT_CHARS: usize = 120;

const FALLBACK_NAME: &str = "untitled";

/// 清理作者名/标题，使其可作为单个路径组件使用。
///
/// 写文件时和生成下载记录时都必须调用这个函数，否则两边算出的路径会不一致。
pub fn sanitize_path_component(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let name = WS_RE.replace_all(name.trim(), " ");
    let name = name.trim_end_matches([' ', '.']);

    let truncated: String = name.chars().take(MAX_COMPONENT_CHARS).collect();
    let truncated = truncated.trim_end_matches([' ', '.']).trim_start();

    if truncated.is_empty() || truncated.chars().all(|c| c == '.') {
        FALLBACK_NAME.to_string()
    } else {
        truncated.to_string()
    }
}

/// 计算视频的输出路径: `{root}/{author}/{title}.mp4`
pub fn output_path(root: &Path, author: &str, title: &str) -> PathBuf {
    root.join(sanitize_path_component(author))
        .join(format!("{}.mp4", sanitize_path_component(title)))
}
