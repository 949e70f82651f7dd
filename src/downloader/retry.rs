//! 指数退避重试

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 重试前的等待时间序列: d0 = initial, d(n+1) = min(max, d(n) * factor)
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |d| {
            Some(d.mul_f64(self.backoff_factor).min(self.max_delay))
        })
        .take(self.max_retries as usize)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// 所属的执行范围被取消
    Cancelled,
    /// 不可重试的错误，立即返回
    Aborted(E),
    /// 重试次数用尽
    Exhausted { attempts: u32, last: E },
}

/// 按策略执行 `op`，失败时指数退避重试。
///
/// 每次尝试和每次等待都会与 `token` 竞争，取消后不会再重试。
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = policy.delays();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = tokio::select! {
            r = op() => r,
            _ = token.cancelled() => return Err(RetryError::Cancelled),
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !is_retryable(&err) {
            return Err(RetryError::Aborted(err));
        }
        let Some(delay) = delays.next() else {
            return Err(RetryError::Exhausted { attempts, last: err });
        };
        warn!("第 {} 次尝试失败: {}，{:?} 后重试", attempts, err, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = token.cancelled() => return Err(RetryError::Cancelled),
        }
    }
}
