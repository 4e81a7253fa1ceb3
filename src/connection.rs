//! 连接管理
//!
//! `ConnectionManager` 持有唯一的底层客户端，显式维护 [`ConnectionState`]：
//! - 并发 `connect()` 共享同一次连接尝试
//! - 可重试错误按 [`RetryPolicy`] 原地重试，预算耗尽或不可重试错误升级为致命错误
//! - `disconnect()` 幂等，总会调用底层释放
//! - 连接尝试进行中调用 `disconnect()`，迟到的客户端会被立即释放
//! - 每次连接尝试分配递增代次，`mark_stale` 只丢弃同代次的客户端

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};

use crate::broker::Connector;
use crate::error::{MessagingError, Result};
use crate::health::{HealthService, HealthStatus};
use crate::retry::{RetryPolicy, RetryScheduler, RetryState, retry_with_policy};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type PendingConnect<T> = Shared<BoxFuture<'static, Result<T>>>;

enum Slot<T> {
    Disconnected,
    Connecting { epoch: u64, attempt: PendingConnect<T> },
    Connected { epoch: u64, client: T },
}

impl<T> Slot<T> {
    fn state(&self) -> ConnectionState {
        match self {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Connected { .. } => ConnectionState::Connected,
        }
    }

    fn epoch(&self) -> Option<u64> {
        match self {
            Slot::Disconnected => None,
            Slot::Connecting { epoch, .. } | Slot::Connected { epoch, .. } => Some(*epoch),
        }
    }
}

struct Inner<C: Connector> {
    connector: C,
    policy: Arc<dyn RetryPolicy>,
    scheduler: RetryScheduler,
    slot: Mutex<Slot<C::Client>>,
    epoch: AtomicU64,
    retry_state: Mutex<RetryState>,
    health: OnceLock<HealthService>,
}

/// 连接管理器
///
/// 克隆共享同一个连接
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, policy: Arc<dyn RetryPolicy>, scheduler: RetryScheduler) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                scheduler,
                slot: Mutex::new(Slot::Disconnected),
                epoch: AtomicU64::new(0),
                retry_state: Mutex::new(RetryState::new()),
                health: OnceLock::new(),
            }),
        }
    }

    /// 连接到 broker，返回活动客户端
    ///
    /// 已连接时直接返回；连接中时等待进行中的尝试
    pub async fn connect(&self) -> Result<C::Client> {
        self.connect_with_epoch().await.map(|(_, client)| client)
    }

    /// 同 [`connect`](Self::connect)，同时返回客户端所属的连接代次，供 [`mark_stale`](Self::mark_stale) 使用
    pub async fn connect_with_epoch(&self) -> Result<(u64, C::Client)> {
        let (epoch, attempt) = {
            let mut slot = lock(&self.inner.slot);
            match &*slot {
                Slot::Connected { epoch, client } => return Ok((*epoch, client.clone())),
                Slot::Connecting { epoch, attempt } => (*epoch, attempt.clone()),
                Slot::Disconnected => {
                    if self.inner.scheduler.is_cancelled() {
                        return Err(MessagingError::Cancelled);
                    }

                    let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(inner.establish(epoch));
                    let attempt = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(join_err) => Err(MessagingError::from(join_err)),
                        }
                    }
                    .boxed()
                    .shared();

                    *slot = Slot::Connecting {
                        epoch,
                        attempt: attempt.clone(),
                    };
                    (epoch, attempt)
                }
            }
        };

        attempt.await.map(|client| (epoch, client))
    }

    /// 断开连接
    ///
    /// 幂等；未连接时也会调用底层释放
    pub async fn disconnect(&self) -> Result<()> {
        let (previous, client) = {
            let mut slot = lock(&self.inner.slot);
            let previous = slot.state();
            let client = match std::mem::replace(&mut *slot, Slot::Disconnected) {
                Slot::Connected { client, .. } => Some(client),
                _ => None,
            };
            (previous, client)
        };

        let name = self.inner.connector.name();
        debug!(client = %name, previous = ?previous, "Disconnecting");

        let result = self.inner.connector.disconnect(client).await;
        self.inner.report(HealthStatus::NotServing).await;

        match &result {
            Ok(()) => info!(client = %name, "Disconnected"),
            Err(err) => error!(client = %name, error = %err, "Disconnect failed"),
        }
        result
    }

    /// 丢弃代次为 `epoch` 的客户端，下一次 `connect()` 重新建立连接
    ///
    /// 已被更新的连接取代时不做任何事
    pub fn mark_stale(&self, epoch: u64) {
        let mut slot = lock(&self.inner.slot);
        let current = slot.epoch();
        if slot.state() == ConnectionState::Connected && current == Some(epoch) {
            warn!(client = %self.inner.connector.name(), epoch, "Connection marked stale");
            *slot = Slot::Disconnected;
        } else {
            debug!(
                client = %self.inner.connector.name(),
                epoch,
                current = ?current,
                "Stale mark ignored, connection already replaced"
            );
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.slot).state()
    }

    pub fn is_active(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    /// 当前连接代次，每次新的连接尝试递增
    pub fn epoch(&self) -> Option<u64> {
        lock(&self.inner.slot).epoch()
    }

    pub fn retry_state(&self) -> RetryState {
        lock(&self.inner.retry_state).clone()
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn name(&self) -> &str {
        self.inner.connector.name()
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.inner.scheduler
    }

    /// 关联健康检查服务，连接状态变化时上报
    pub fn attach_health(&self, health: HealthService) {
        let _ = self.inner.health.set(health);
    }
}

impl<C: Connector> Inner<C> {
    async fn establish(self: Arc<Self>, epoch: u64) -> Result<C::Client> {
        let name = self.connector.name();
        info!(client = %name, epoch, "Connecting to broker");

        let result = retry_with_policy(
            self.policy.as_ref(),
            &self.scheduler,
            "connect",
            |_| self.connector.connect(),
            |_, delay| lock(&self.retry_state).record_retry(delay),
        )
        .await;

        match result {
            Ok(client) => {
                let current = {
                    let mut slot = lock(&self.slot);
                    let current = matches!(&*slot, Slot::Connecting { epoch: e, .. } if *e == epoch);
                    if current {
                        *slot = Slot::Connected {
                            epoch,
                            client: client.clone(),
                        };
                    }
                    current
                };

                if !current {
                    warn!(client = %name, epoch, "Connection superseded by disconnect, releasing it");
                    if let Err(err) = self.connector.disconnect(Some(client)).await {
                        warn!(client = %name, error = %err, "Failed to release superseded connection");
                    }
                    return Err(MessagingError::Cancelled);
                }

                lock(&self.retry_state).reset();
                self.report(HealthStatus::Serving).await;
                info!(client = %name, epoch, "Connected to broker");
                Ok(client)
            }
            Err(err) => {
                {
                    let mut slot = lock(&self.slot);
                    if matches!(&*slot, Slot::Connecting { epoch: e, .. } if *e == epoch) {
                        *slot = Slot::Disconnected;
                    }
                }

                let err = err.into_fatal();
                if err.is_cancelled() {
                    info!(client = %name, "Connect cancelled by shutdown");
                } else {
                    error!(client = %name, error = %err, "Failed to connect to broker");
                    self.report(HealthStatus::NotServing).await;
                }
                Err(err)
            }
        }
    }

    async fn report(&self, status: HealthStatus) {
        if let Some(health) = self.health.get() {
            health.set_status(self.connector.name(), status).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::retry::ExponentialBackoffPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicU32,
        disconnects: AtomicU32,
        released_clients: AtomicU32,
        failures: AtomicU32,
        fatal: bool,
        latency: Duration,
    }

    #[async_trait]
    impl Connector for Arc<CountingConnector> {
        type Client = u32;

        fn name(&self) -> &str {
            "counting"
        }

        async fn connect(&self) -> Result<u32> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.fatal {
                return Err(MessagingError::protocol(ErrorCode::InvalidRecord, "rejected"));
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(MessagingError::connection("connection refused"));
            }
            Ok(n)
        }

        async fn disconnect(&self, client: Option<u32>) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if client.is_some() {
                self.released_clients.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn manager(connector: CountingConnector, max_retries: u32) -> (ConnectionManager<Arc<CountingConnector>>, Arc<CountingConnector>) {
        let connector = Arc::new(connector);
        let policy = ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2), 2.0)
            .with_max_retries(max_retries);
        let manager = ConnectionManager::new(Arc::clone(&connector), Arc::new(policy), RetryScheduler::new());
        (manager, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_attempt() {
        let (manager, connector) = manager(
            CountingConnector {
                latency: Duration::from_millis(50),
                ..Default::default()
            },
            3,
        );

        let callers = (0..8).map(|_| {
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        let results = futures::future::join_all(callers).await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), 1);
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_within_budget_reset_retry_state() {
        let (manager, connector) = manager(
            CountingConnector {
                failures: AtomicU32::new(2),
                ..Default::default()
            },
            3,
        );

        assert_eq!(manager.connect().await.unwrap(), 3);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(manager.retry_state().attempt, 0);
        assert_eq!(manager.state(), ConnectionState::Connected);

        // 已连接时不再调用底层
        manager.connect().await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_fatal_and_leaves_disconnected() {
        let (manager, connector) = manager(
            CountingConnector {
                failures: AtomicU32::new(10),
                ..Default::default()
            },
            2,
        );

        let err = manager.connect().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::RetryBudgetExhausted);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn non_retriable_error_is_fatal_immediately() {
        let (manager, connector) = manager(
            CountingConnector {
                fatal: true,
                ..Default::default()
            },
            5,
        );

        let err = manager.connect().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::InvalidRecord);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_always_releases() {
        let (manager, connector) = manager(CountingConnector::default(), 1);

        manager.disconnect().await.unwrap();
        manager.connect().await.unwrap();
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();

        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 3);
        assert_eq!(connector.released_clients.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_releases_late_client() {
        let (manager, connector) = manager(
            CountingConnector {
                latency: Duration::from_millis(200),
                ..Default::default()
            },
            1,
        );

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.disconnect().await.unwrap();
        let result = pending.await.unwrap();

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.released_clients.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mark_stale_forces_reconnect() {
        let (manager, connector) = manager(CountingConnector::default(), 1);

        let (epoch, client) = manager.connect_with_epoch().await.unwrap();
        assert_eq!(client, 1);
        manager.mark_stale(epoch);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.connect().await.unwrap(), 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn late_stale_mark_keeps_newer_connection() {
        let (manager, connector) = manager(CountingConnector::default(), 1);

        let (old_epoch, _) = manager.connect_with_epoch().await.unwrap();
        manager.mark_stale(old_epoch);
        let (new_epoch, client) = manager.connect_with_epoch().await.unwrap();
        assert!(new_epoch > old_epoch);

        // 旧客户端上迟到的失败不能丢弃新连接
        manager.mark_stale(old_epoch);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.epoch(), Some(new_epoch));
        assert_eq!(manager.connect().await.unwrap(), client);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_scheduler_refuses_new_attempts() {
        let (manager, connector) = manager(CountingConnector::default(), 1);
        manager.scheduler().cancel();

        assert!(manager.connect().await.unwrap_err().is_cancelled());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }
}
