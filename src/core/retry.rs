//! 有界重试

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// 默认总尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次），至少为 1
    pub max_attempts: u32,
    /// 退避基础延迟，为 0 时不等待
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 不等待的策略
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// 第 `attempt` 次失败后的等待时间（指数退避）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// 所有尝试都失败
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub label: String,
    pub attempts: u32,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: 已尝试 {} 次仍失败: {}",
            self.label, self.attempts, self.last_error
        )
    }
}

impl<E> std::error::Error for RetryExhausted<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last_error)
    }
}

/// 按策略执行操作，直到成功或尝试次数用尽
///
/// `operation` 接收当前尝试序号（从 1 开始）。
pub async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} 失败，{}ms 后重试 ({}/{}): {}",
                    label,
                    delay.as_millis(),
                    attempt,
                    max_attempts,
                    e
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => {
                error!("{} 最终失败 (已尝试{}次): {}", label, attempt, e);
                return Err(RetryExhausted {
                    label: label.to_string(),
                    attempts: attempt,
                    last_error: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail_times(failures: u32, policy: RetryPolicy) -> (Result<u32, RetryExhausted<String>>, u32) {
        let calls = AtomicU32::new(0);
        let result = with_retry(policy, "test", |attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(n, attempt);
            async move {
                if n <= failures {
                    Err(format!("failure {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_succeeds_iff_failures_below_attempts() {
        for failures in 0..6 {
            let (result, calls) = fail_times(failures, RetryPolicy::immediate(3)).await;
            assert_eq!(result.is_ok(), failures < 3, "failures={}", failures);
            assert!(calls <= 3);
            if let Ok(attempt) = result {
                assert_eq!(attempt, failures + 1);
            }
        }
    }

    #[tokio::test]
    async fn test_exhausted_carries_last_error() {
        let (result, calls) = fail_times(10, RetryPolicy::immediate(3)).await;
        let err = result.unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "failure 3");
        assert!(err.to_string().contains("failure 3"));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let (result, calls) = fail_times(1, RetryPolicy::immediate(0)).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_backoff_waits_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let started = std::time::Instant::now();
        let (result, _) = fail_times(2, policy).await;
        assert!(result.is_ok());
        // 10ms + 20ms
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_delay_is_exponential() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(RetryPolicy::immediate(3).delay_for(3), Duration::ZERO);
    }
}
