//! 可取消的退避计时器
//!
//! 所有退避等待都经由 `RetryScheduler`，关闭协调器取消 token 后
//! 不再启动新的等待，正在等待的计时器立即以 `Cancelled` 结束

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::MessagingError;

/// 退避计时器
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    token: CancellationToken,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用外部 token（通常来自关闭协调器）
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// 派生子计时器：父级取消时子级同时取消，子级取消不影响父级
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待 `delay`，期间被取消则返回 `Cancelled`
    pub async fn sleep(&self, delay: Duration) -> Result<(), MessagingError> {
        if self.token.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(MessagingError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_err, task};

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let scheduler = RetryScheduler::new();
        let started = tokio::time::Instant::now();
        scheduler.sleep(Duration::from_secs(3)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_sleep() {
        let scheduler = RetryScheduler::new();
        let mut pending = task::spawn(scheduler.sleep(Duration::from_secs(3600)));
        assert_pending!(pending.poll());

        scheduler.cancel();
        assert!(pending.is_woken());
        let err = assert_ready_err!(pending.poll());
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn child_follows_parent_only() {
        let parent = RetryScheduler::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
        assert!(other.sleep(Duration::from_millis(1)).await.is_err());
    }
}
