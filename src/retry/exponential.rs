use super::RetryPolicy;
use crate::error::MessagingError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 自定义重试判定
pub type RetryPredicate = Arc<dyn Fn(&MessagingError) -> bool + Send + Sync>;

/// 指数退避重试策略
///
/// `delay(attempt) = min(max_delay, initial_delay * multiplier^attempt)`
#[derive(Clone)]
pub struct ExponentialBackoffPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_retries: Option<u32>,
    predicate: Option<RetryPredicate>,
}

impl ExponentialBackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: multiplier.max(1.0),
            max_retries: None,
            predicate: None,
        }
    }

    /// 设置最大重试次数（不含首次尝试）
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// 设置自定义重试判定，替代错误自带的可重试分类
    #[must_use]
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&MessagingError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// 第 `attempt` 次重试前的等待时长
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let nanos = self.initial_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
    }
}

impl fmt::Debug for ExponentialBackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExponentialBackoffPolicy")
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("max_retries", &self.max_retries)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: u32, error: &MessagingError) -> bool {
        if error.is_fatal() || error.is_cancelled() {
            return false;
        }

        if let Some(max_retries) = self.max_retries {
            if attempt >= max_retries {
                return false;
            }
        }

        match &self.predicate {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        self.next_delay(attempt)
    }

    fn max_attempts(&self) -> Option<u32> {
        self.max_retries.map(|retries| retries.saturating_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn policy() -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(Duration::from_millis(1000), Duration::from_millis(30000), 2.0)
    }

    #[test]
    fn delay_grows_geometrically_until_capped() {
        let policy = policy();
        assert_eq!(policy.next_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.next_delay(4), Duration::from_millis(16000));
        assert_eq!(policy.next_delay(5), Duration::from_millis(30000));
        assert_eq!(policy.next_delay(500), Duration::from_millis(30000));
    }

    #[test]
    fn fractional_multiplier() {
        let policy =
            ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 1.5);
        assert_eq!(policy.next_delay(2), Duration::from_millis(225));
    }

    #[test]
    fn max_retries_bounds_attempts() {
        let policy = policy().with_max_retries(3);
        let err = MessagingError::connection("refused");
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
        assert_eq!(policy.max_attempts(), Some(4));
    }

    #[test]
    fn predicate_overrides_classification_but_not_fatal() {
        let policy = policy().with_predicate(|err| err.code() == ErrorCode::MessageTooLarge);
        assert!(policy.should_retry(0, &MessagingError::protocol(ErrorCode::MessageTooLarge, "")));
        assert!(!policy.should_retry(0, &MessagingError::connection("refused")));
        assert!(!policy.should_retry(0, &MessagingError::configuration("bad")));
    }
}
