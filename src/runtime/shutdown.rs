//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后：
//! 1. 取消共享 token，重试计时器不再启动，消费者停止派发新记录
//! 2. 依次关闭每个仍处于活动状态的句柄，记录结果
//! 3. 全部成功退出码为 0，任一失败为 1

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{error, info, warn};

use super::config::RuntimeConfig;
use crate::broker::{Connector, ConsumerClient, ProducerClient};
use crate::connection::ConnectionManager;
use crate::consumer::{Consumer, MessageHandler};
use crate::error::{MessagingError, Result};
use crate::producer::Producer;
use crate::retry::RetryScheduler;

static INSTALLED: AtomicBool = AtomicBool::new(false);

// ============================================================================
// 可关闭句柄
// ============================================================================

/// 可由关闭协调器关闭的句柄
#[async_trait]
pub trait ShutdownHandle: Send + Sync {
    fn name(&self) -> &str;

    /// 是否持有连接或仍在运行
    fn is_active(&self) -> bool;

    async fn shutdown(&self, timeout: Duration) -> Result<()>;
}

#[async_trait]
impl<C> ShutdownHandle for Producer<C>
where
    C: Connector,
    C::Client: ProducerClient,
{
    fn name(&self) -> &str {
        self.connection().name()
    }

    fn is_active(&self) -> bool {
        Producer::is_active(self)
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<()> {
        self.disconnect().await
    }
}

#[async_trait]
impl<C> ShutdownHandle for Consumer<C>
where
    C: Connector + Clone,
    C::Client: ConsumerClient,
{
    fn name(&self) -> &str {
        self.connection().name()
    }

    fn is_active(&self) -> bool {
        Consumer::is_active(self)
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        Consumer::shutdown(self, timeout).await
    }
}

#[async_trait]
impl<C: Connector> ShutdownHandle for ConnectionManager<C> {
    fn name(&self) -> &str {
        ConnectionManager::name(self)
    }

    fn is_active(&self) -> bool {
        ConnectionManager::is_active(self)
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<()> {
        self.disconnect().await
    }
}

// ============================================================================
// 关闭结果
// ============================================================================

/// 单个句柄的关闭结果
#[derive(Debug, Clone)]
pub struct ShutdownOutcome {
    pub name: String,
    /// `None` 表示句柄未处于活动状态，已跳过
    pub result: Option<std::result::Result<(), String>>,
}

impl ShutdownOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.result, Some(Err(_)))
    }
}

/// 关闭报告
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub outcomes: Vec<ShutdownOutcome>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        !self.outcomes.iter().any(ShutdownOutcome::is_failure)
    }

    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() { 0 } else { 1 }
    }
}

// ============================================================================
// 关闭协调器
// ============================================================================

/// 关闭协调器
pub struct ShutdownCoordinator {
    config: RuntimeConfig,
    scheduler: RetryScheduler,
    handles: Mutex<Vec<Arc<dyn ShutdownHandle>>>,
}

impl ShutdownCoordinator {
    /// 构造进程唯一的协调器，重复调用返回配置错误
    pub fn install(config: RuntimeConfig) -> Result<Self> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::configuration(
                "shutdown coordinator already installed for this process",
            ));
        }
        Ok(Self::new(config))
    }

    /// 构造不受进程唯一限制的协调器
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            scheduler: RetryScheduler::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 生产者、消费者应基于此计时器创建，关闭时一并取消
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn register<H: ShutdownHandle + 'static>(&self, handle: H) {
        info!(handle = %handle.name(), "Registering shutdown handle");
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handle));
    }

    /// 手动触发关闭
    pub fn trigger(&self) {
        self.scheduler.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.scheduler.is_cancelled()
    }

    /// 等待终止信号或手动触发
    pub async fn wait_for_signal(&self) {
        let token = self.scheduler.token();
        tokio::select! {
            signal = termination_signal() => match signal {
                Ok(name) => info!(signal = name, "Shutdown signal received"),
                Err(err) => {
                    error!(error = %err, "Failed to listen for termination signals");
                    token.cancelled().await;
                }
            },
            _ = token.cancelled() => info!("Shutdown triggered"),
        }
    }

    /// 取消共享 token 并关闭全部活动句柄
    pub async fn shutdown(&self) -> ShutdownReport {
        self.scheduler.cancel();

        let handles: Vec<Arc<dyn ShutdownHandle>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let timeout = self.config.shutdown_timeout();
        let mut report = ShutdownReport::default();

        for handle in handles {
            let name = handle.name().to_string();
            if !handle.is_active() {
                info!(handle = %name, "Handle not active, skipping");
                report.outcomes.push(ShutdownOutcome { name, result: None });
                continue;
            }

            // 消费者内部等待 handler 最长 timeout，再额外留出断开连接的时间
            let result = match tokio::time::timeout(timeout * 2, handle.shutdown(timeout)).await {
                Ok(Ok(())) => {
                    info!(handle = %name, "Disconnected cleanly");
                    Ok(())
                }
                Ok(Err(err)) => {
                    error!(handle = %name, error = %err, "Disconnect failed");
                    Err(err.to_string())
                }
                Err(_) => {
                    warn!(handle = %name, timeout_ms = timeout.as_millis() as u64, "Disconnect timed out");
                    Err("shutdown timed out".to_string())
                }
            };
            report.outcomes.push(ShutdownOutcome {
                name,
                result: Some(result),
            });
        }

        info!(
            handles = report.outcomes.len(),
            clean = report.is_clean(),
            exit_code = report.exit_code(),
            "Shutdown complete"
        );
        report
    }

    /// 等待信号后关闭
    pub async fn run_until_signal(&self) -> ShutdownReport {
        self.wait_for_signal().await;
        self.shutdown().await
    }

    /// 等待信号、关闭并以相应退出码结束进程，不会返回
    pub async fn exit_on_signal(self) {
        let report = self.run_until_signal().await;
        std::process::exit(report.exit_code())
    }
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl+C")
}

// ============================================================================
// 进程级消费入口
// ============================================================================

/// 运行消费者，致命错误附带 topic 上下文返回
pub async fn consume<C, H>(consumer: &Consumer<C>, topic: &str, handler: H) -> anyhow::Result<()>
where
    C: Connector + Clone,
    C::Client: ConsumerClient,
    H: MessageHandler,
{
    consumer
        .run(topic, handler)
        .await
        .with_context(|| format!("consumer for topic '{topic}' stopped with a fatal error"))
}

/// 运行消费者，致命错误时以退出码 1 结束进程
pub async fn consume_or_exit<C, H>(consumer: &Consumer<C>, topic: &str, handler: H)
where
    C: Connector + Clone,
    C::Client: ConsumerClient,
    H: MessageHandler,
{
    if let Err(err) = consume(consumer, topic, handler).await {
        error!(error = %format!("{err:#}"), "Fatal consumer error, exiting");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FakeHandle {
        name: &'static str,
        active: bool,
        fail: bool,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ShutdownHandle for FakeHandle {
        fn name(&self) -> &str {
            self.name
        }

        fn is_active(&self) -> bool {
            self.active
        }

        async fn shutdown(&self, _timeout: Duration) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MessagingError::connection("socket closed"))
            } else {
                Ok(())
            }
        }
    }

    fn fake(name: &'static str, active: bool, fail: bool, calls: &Arc<AtomicU32>) -> FakeHandle {
        FakeHandle {
            name,
            active,
            fail,
            calls: Arc::clone(calls),
        }
    }

    #[test]
    fn install_is_once_per_process() {
        assert!(ShutdownCoordinator::install(RuntimeConfig::default()).is_ok());
        let err = ShutdownCoordinator::install(RuntimeConfig::default()).err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn clean_shutdown_exits_zero_and_skips_inactive() {
        let calls = Arc::new(AtomicU32::new(0));
        let coordinator = ShutdownCoordinator::new(RuntimeConfig::default());
        coordinator.register(fake("producer", true, false, &calls));
        coordinator.register(fake("admin", false, false, &calls));

        let report = coordinator.shutdown().await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(report.outcomes[1].result.is_none());
        assert!(coordinator.scheduler().is_cancelled());
    }

    #[tokio::test]
    async fn failed_disconnect_exits_one_but_closes_everything() {
        let calls = Arc::new(AtomicU32::new(0));
        let coordinator = ShutdownCoordinator::new(RuntimeConfig::default());
        coordinator.register(fake("producer", true, true, &calls));
        coordinator.register(fake("consumer", true, false, &calls));

        let report = coordinator.shutdown().await;

        assert_eq!(report.exit_code(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(report.outcomes[0].is_failure());
        assert!(!report.outcomes[1].is_failure());
    }

    #[tokio::test]
    async fn trigger_releases_signal_wait() {
        let coordinator = Arc::new(ShutdownCoordinator::new(RuntimeConfig::default()));
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_until_signal().await })
        };

        coordinator.trigger();
        let report = waiter.await.unwrap();
        assert!(report.is_clean());
    }
}
