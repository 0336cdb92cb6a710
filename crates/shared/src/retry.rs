//! 启动阶段重试
//!
//! 进程启动时 broker 可能尚未就绪（容器编排中常见），连接建立按指数退避重试有限次数，
//! 仍失败则由调用方终止进程。投递处理管道内部不使用重试。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ProvisionError;

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 最多重试 5 次，初始等待 500 毫秒，最大等待 10 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 计算第 N 次重试的等待时间（attempt 从 0 开始）
    ///
    /// initial_delay * multiplier^attempt，不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// 带重试的异步执行器
///
/// 只有 `ProvisionError::is_retryable` 为真的错误才会重试，其余错误直接返回。
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => {
                warn!(
                    operation = operation_name,
                    error = %err,
                    code = err.code(),
                    "操作失败且不可重试"
                );
                return Err(err);
            }
            Err(err) if !policy.should_retry(attempt) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "已达最大重试次数，放弃重试"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
