//! 分块相关的字节范围计算

/// 文件按 `chunk_size` 切分后的分块数（向上取整），空文件为 0。
/// 分块数超出 `u32` 时返回 None
pub fn chunk_count(total_size: u64, chunk_size: u64) -> Option<u32> {
    if total_size == 0 || chunk_size == 0 {
        return Some(0);
    }
    u32::try_from(total_size.div_ceil(chunk_size)).ok()
}

/// 一个闭区间字节范围 `[start, end]`，对应一次 Range 请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// 第 `index` 个分块的字节范围；越界时返回 None
pub fn chunk_range(index: u32, chunk_size: u64, total_size: u64) -> Option<ByteRange> {
    let start = index as u64 * chunk_size;
    if chunk_size == 0 || start >= total_size {
        return None;
    }
    let end = (start + chunk_size - 1).min(total_size - 1);
    Some(ByteRange { start, end })
}

/// 断点续传时写入的起始偏移
pub fn resume_offset(chunks_completed: u32, chunk_size: u64) -> u64 {
    chunks_completed as u64 * chunk_size
}
