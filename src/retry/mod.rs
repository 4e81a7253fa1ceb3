//! 重试策略模块
//!
//! - [`ExponentialBackoffPolicy`]: 连接/发送/崩溃恢复使用的指数退避
//! - [`FixedRetryPolicy`]: topic 探测使用的固定间隔、有限次数重试
//! - [`RetryScheduler`]: 可取消的退避计时器，关闭后不再启动新的等待

pub mod exponential;
pub mod fixed;
pub mod scheduler;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;
pub use scheduler::RetryScheduler;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::MessagingError;

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待指定时长后重试
    Retry(Duration),
    /// 停止重试，本次操作失败
    Fatal,
}

/// 重试策略 trait
///
/// `attempt` 为已失败次数减一（第一次失败后为 0）
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: u32, error: &MessagingError) -> bool;
    fn backoff_duration(&self, attempt: u32) -> Duration;
    /// 最多执行的总次数（首次 + 重试），`None` 表示不限次数
    fn max_attempts(&self) -> Option<u32>;

    fn decide(&self, attempt: u32, error: &MessagingError) -> RetryDecision {
        if self.should_retry(attempt, error) {
            RetryDecision::Retry(self.backoff_duration(attempt))
        } else {
            RetryDecision::Fatal
        }
    }
}

/// 重试状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Duration,
    pub started_at: DateTime<Utc>,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            next_delay: Duration::ZERO,
            started_at: Utc::now(),
        }
    }

    /// 记录一次失败后的重试
    pub fn record_retry(&mut self, next_delay: Duration) {
        if self.attempt == 0 {
            self.started_at = Utc::now();
        }
        self.attempt += 1;
        self.next_delay = next_delay;
    }

    /// 成功后归零
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = Duration::ZERO;
        self.started_at = Utc::now();
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// 按策略执行异步操作
///
/// - 成功立即返回
/// - 可重试错误经 `scheduler` 退避后重试，`on_retry` 收到 (attempt, delay)
/// - 预算耗尽返回 `RetryBudgetExhausted` 致命错误
/// - 不可重试错误原样返回，由调用方决定是否升级为致命错误
/// - 退避期间收到关闭信号返回 `Cancelled`
pub async fn retry_with_policy<T, F, Fut, O>(
    policy: &dyn RetryPolicy,
    scheduler: &RetryScheduler,
    operation: &str,
    mut op: F,
    mut on_retry: O,
) -> Result<T, MessagingError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, MessagingError>>,
    O: FnMut(u32, Duration),
{
    let mut attempt: u32 = 0;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match policy.decide(attempt, &err) {
            RetryDecision::Retry(delay) => {
                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retriable failure, backing off"
                );
                on_retry(attempt, delay);
                scheduler.sleep(delay).await?;
                attempt += 1;
            }
            RetryDecision::Fatal if !err.is_retryable() => return Err(err),
            RetryDecision::Fatal => {
                return Err(MessagingError::retry_exhausted(operation, attempt + 1, &err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0)
            .with_max_retries(max_retries)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_within_budget() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let result = retry_with_policy(
            &policy(3),
            &RetryScheduler::new(),
            "connect",
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(MessagingError::connection("refused"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |attempt, delay| retries.push((attempt, delay)),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            retries,
            vec![(0, Duration::from_millis(100)), (1, Duration::from_millis(200))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_policy(
            &policy(2),
            &RetryScheduler::new(),
            "connect",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MessagingError::connection("refused")) }
            },
            |_, _| {},
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::RetryBudgetExhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_error_is_returned_untouched() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_policy(
            &policy(5),
            &RetryScheduler::new(),
            "produce",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(MessagingError::protocol(ErrorCode::MessageTooLarge, "too big")) }
            },
            |_, _| {},
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTooLarge);
        assert!(!err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_scheduler_stops_retrying() {
        let scheduler = RetryScheduler::new();
        scheduler.cancel();

        let result: Result<(), _> = retry_with_policy(
            &policy(5),
            &scheduler,
            "connect",
            |_| async { Err(MessagingError::connection("refused")) },
            |_, _| {},
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn retry_state_resets() {
        let mut state = RetryState::new();
        state.record_retry(Duration::from_millis(100));
        state.record_retry(Duration::from_millis(200));
        assert_eq!(state.attempt, 2);
        assert_eq!(state.next_delay, Duration::from_millis(200));

        state.reset();
        assert_eq!(state.attempt, 0);
        assert_eq!(state.next_delay, Duration::ZERO);
    }
}
