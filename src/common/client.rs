use reqwest::{
    Client, ClientBuilder, Response, StatusCode,
    header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, RANGE},
};
use tracing::{debug, warn};

use crate::common::config::Settings;
use crate::downloader::chunk::ByteRange;
use crate::downloader::error::DownloadError;

/// 下载用的 HTTP 客户端，负责分块的 Range 请求
#[derive(Debug, Clone)]
pub struct DownloadClient {
    pub inner: Client,
}

impl DownloadClient {
    pub fn new(settings: &Settings) -> Result<Self, DownloadError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, reqwest::header::HeaderValue::from_static("*/*"));

        let inner = ClientBuilder::new()
            .timeout(settings.request_timeout())
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .build()?;
        Ok(Self { inner })
    }

    pub fn from_client(inner: Client) -> Self {
        Self { inner }
    }

    /// 拉取一个分块。206 直接接受；200 只有在响应体长度正好等于请求范围时才接受，
    /// 否则说明服务器忽略了 Range，写入会破坏输出文件。
    pub async fn fetch_range(&self, url: &str, range: ByteRange) -> Result<Vec<u8>, DownloadError> {
        debug!("请求分块: {} {}", url, range.header_value());
        let response = self
            .inner
            .get(url)
            .header(RANGE, range.header_value())
            .send()
            .await?;

        Self::check_response_status(&response, url)?;

        let status = response.status();
        if status == StatusCode::OK {
            if let Some(length) = response.content_length() {
                if length != range.len() {
                    return Err(DownloadError::RangeIgnored {
                        requested: range.len(),
                        received: length,
                    });
                }
            }
        } else if status != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        if status == StatusCode::OK && body.len() as u64 != range.len() {
            return Err(DownloadError::RangeIgnored {
                requested: range.len(),
                received: body.len() as u64,
            });
        }
        Ok(body.to_vec())
    }

    /// 通过 HEAD 请求获取远程文件大小
    pub async fn probe_size(&self, url: &str) -> Result<u64, DownloadError> {
        let response = self.inner.head(url).send().await?;
        Self::check_response_status(&response, url)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .unwrap_or("application/octet-stream");
        // 检查是否为HTML内容（可能是错误页面）
        if content_type.contains("text/html") {
            warn!("URL 返回 HTML 内容，可能不是文件下载链接: {}", url);
            return Err(DownloadError::InvalidUrl(format!("URL 返回 HTML 内容: {}", url)));
        }

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|ct_len| ct_len.to_str().ok())
            .and_then(|ct_len| ct_len.parse().ok())
            .ok_or_else(|| DownloadError::InvalidUrl(format!("无法获取文件大小: {}", url)))
    }

    // 检查响应状态并处理特殊情况
    fn check_response_status(response: &Response, url: &str) -> Result<(), DownloadError> {
        let status = response.status();
        debug!("Response Status: {}", status);

        match status {
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                warn!("🚫 检测到 {} 状态码，链接可能已失效", status);
                Err(DownloadError::AccessDenied(format!(
                    "访问被拒绝 ({})，URL: {}",
                    status, url
                )))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("⚠️ 检测到 429 Too Many Requests 状态码，请求过于频繁");
                Err(DownloadError::RateLimited(format!(
                    "请求过于频繁 (429 Too Many Requests)，URL: {}",
                    url
                )))
            }
            status if status.is_success() => Ok(()),
            _ => {
                warn!("❌ 非成功状态码: {}", status);
                Err(DownloadError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                })
            }
        }
    }
}
