use super::RetryPolicy;
use crate::error::MessagingError;
use std::time::Duration;

/// 固定延迟重试策略
///
/// 用于 topic 探测：最多执行 `max_attempts` 次，每次间隔固定 `delay`
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: u32, error: &MessagingError) -> bool {
        if attempt + 1 >= self.max_attempts {
            return false;
        }

        error.is_retryable()
    }

    fn backoff_duration(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts)
    }
}
