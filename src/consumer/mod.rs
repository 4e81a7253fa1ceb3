//! 消费者
//!
//! 状态机：`Idle → Probing → Connecting → Subscribed → Running →
//! {Disconnecting → Idle | Crashed → Backoff → Probing}`
//!
//! - 订阅前探测 topic 是否存在，固定间隔、有限次数，耗尽为致命错误
//! - 每分区一个 worker，分区内按 offset 顺序处理，跨分区由信号量限制并发
//! - handler 返回后 offset 才可提交；按时间间隔或完成数阈值提交，先到先触发
//! - 运行循环中的非致命错误触发完整断开、指数退避，然后重新探测

pub mod handler;
pub mod offsets;
mod partition;
pub mod stats;

pub use handler::{HandlerFn, MessageHandler, handler_fn};
pub use offsets::{CommitPolicy, OffsetTracker};
pub use stats::{ConsumerStats, StatsCollector};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Connector, ConsumerClient, StartPosition, TopicMetadata, TopicPartition};
use crate::connection::ConnectionManager;
use crate::error::{MessagingError, Result};
use crate::health::HealthService;
use crate::retry::{
    ExponentialBackoffPolicy, FixedRetryPolicy, RetryDecision, RetryPolicy, RetryScheduler,
    RetryState,
};
use partition::{PartitionWorker, WorkerContext};

/// 消费者阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerPhase {
    Idle,
    Probing,
    Connecting,
    Subscribed,
    Running,
    Disconnecting,
    Crashed,
    Backoff,
}

/// topic 探测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicProbeResult {
    pub exists: bool,
    /// 第几次探测得到结果（从 1 开始）
    pub attempt: u32,
}

/// 消费者设置
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// true 从最早保留的 offset 开始，false 仅消费新记录
    pub from_beginning: bool,
    /// 同时执行的 handler 上限
    pub partition_concurrency: usize,
    pub commit_interval: Duration,
    pub commit_threshold: u64,
    pub max_probe_attempts: u32,
    pub probe_delay: Duration,
    /// 每分区待处理记录缓冲
    pub partition_buffer: usize,
    /// 崩溃恢复退避，计数独立于连接重试
    pub crash_backoff: ExponentialBackoffPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            from_beginning: true,
            partition_concurrency: 4,
            commit_interval: Duration::from_secs(5),
            commit_threshold: 100,
            max_probe_attempts: 10,
            probe_delay: Duration::from_secs(2),
            partition_buffer: 64,
            crash_backoff: ExponentialBackoffPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(30),
                2.0,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CommitTrigger {
    Interval,
    Threshold,
    /// 关闭或崩溃前的最后一次提交，同步等待确认
    Drain,
}

impl CommitTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            CommitTrigger::Interval => "interval",
            CommitTrigger::Threshold => "threshold",
            CommitTrigger::Drain => "drain",
        }
    }
}

enum CycleExit {
    /// 收到关闭信号
    Stopped,
    /// 运行循环中出现错误
    Crashed { error: MessagingError, processed: u64 },
}

struct ConsumerInner<C: Connector> {
    /// 消费者实例标识，用于日志关联
    instance_id: String,
    admin: ConnectionManager<C>,
    connection: ConnectionManager<C>,
    scheduler: RetryScheduler,
    settings: ConsumerSettings,
    probe_policy: FixedRetryPolicy,
    crash_policy: ExponentialBackoffPolicy,
    crash_state: Mutex<RetryState>,
    stats: StatsCollector,
    phase: watch::Sender<ConsumerPhase>,
    stop_error: Mutex<Option<MessagingError>>,
}

/// 消费者
///
/// 克隆共享同一个实例，可以一处运行、另一处关闭
pub struct Consumer<C: Connector> {
    inner: Arc<ConsumerInner<C>>,
}

impl<C: Connector> Clone for Consumer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C> Consumer<C>
where
    C: Connector + Clone,
    C::Client: ConsumerClient,
{
    /// 创建消费者
    ///
    /// `policy` 用于连接重试；`scheduler` 通常来自关闭协调器，取消后消费者停止
    pub fn new(
        connector: C,
        policy: Arc<dyn RetryPolicy>,
        scheduler: &RetryScheduler,
        settings: ConsumerSettings,
    ) -> Self {
        let scheduler = scheduler.child();
        let probe_policy = FixedRetryPolicy::new(settings.max_probe_attempts, settings.probe_delay);
        let crash_policy = settings.crash_backoff.clone().with_predicate(|err| !err.is_fatal());
        let (phase, _) = watch::channel(ConsumerPhase::Idle);

        Self {
            inner: Arc::new(ConsumerInner {
                instance_id: format!("consumer-{}", Uuid::new_v4()),
                admin: ConnectionManager::new(connector.clone(), Arc::clone(&policy), scheduler.child()),
                connection: ConnectionManager::new(connector, policy, scheduler.child()),
                scheduler,
                settings,
                probe_policy,
                crash_policy,
                crash_state: Mutex::new(RetryState::new()),
                stats: StatsCollector::new(),
                phase,
                stop_error: Mutex::new(None),
            }),
        }
    }

    /// 消费 `topic` 直到关闭或出现致命错误
    ///
    /// 关闭时返回 `Ok(())`；致命错误（探测耗尽、认证失败、重试预算耗尽）返回 `Err`
    pub async fn run<H: MessageHandler>(&self, topic: &str, handler: H) -> Result<()> {
        if topic.is_empty() {
            return Err(MessagingError::configuration("consumer topic must not be empty"));
        }

        let inner = &self.inner;
        let handler = Arc::new(handler);
        let mut crash_attempt: u32 = 0;

        let result = loop {
            if inner.scheduler.is_cancelled() {
                break Ok(());
            }

            let (error, processed) = match self.run_cycle(topic, &handler).await {
                Ok(CycleExit::Stopped) => break Ok(()),
                Ok(CycleExit::Crashed { error, processed }) => (error, processed),
                Err(err) if err.is_cancelled() => break Ok(()),
                Err(err) if err.is_fatal() || !err.is_retryable() => break Err(err.into_fatal()),
                Err(err) => (err, 0),
            };

            if processed > 0 {
                crash_attempt = 0;
                lock(&inner.crash_state).reset();
            }

            self.set_phase(ConsumerPhase::Crashed);
            error!(topic = %topic, error = %error, processed, "Consumer crashed, reconnecting");
            inner.stats.record_error().await;
            if let Err(err) = inner.connection.disconnect().await {
                warn!(topic = %topic, error = %err, "Disconnect after crash failed");
            }

            match inner.crash_policy.decide(crash_attempt, &error) {
                RetryDecision::Retry(delay) => {
                    self.set_phase(ConsumerPhase::Backoff);
                    lock(&inner.crash_state).record_retry(delay);
                    info!(
                        topic = %topic,
                        attempt = crash_attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Restarting consumer after backoff"
                    );
                    if inner.scheduler.sleep(delay).await.is_err() {
                        break Ok(());
                    }
                    crash_attempt += 1;
                }
                RetryDecision::Fatal => {
                    break Err(MessagingError::retry_exhausted("consume", crash_attempt + 1, &error));
                }
            }
        };

        self.set_phase(ConsumerPhase::Disconnecting);
        let mut disconnect = inner.admin.disconnect().await;
        if let Err(err) = inner.connection.disconnect().await {
            disconnect = Err(err);
        }
        if let Err(err) = disconnect {
            *lock(&inner.stop_error) = Some(err);
        }
        self.set_phase(ConsumerPhase::Idle);

        match &result {
            Ok(()) => info!(topic = %topic, instance = %inner.instance_id, "Consumer stopped"),
            Err(err) => error!(topic = %topic, error = %err, "Consumer stopped with fatal error"),
        }
        result
    }

    async fn run_cycle<H: MessageHandler>(&self, topic: &str, handler: &Arc<H>) -> Result<CycleExit> {
        let inner = &self.inner;

        self.set_phase(ConsumerPhase::Probing);
        let probe = self.probe_topic(topic).await?;
        debug!(topic = %topic, attempt = probe.attempt, "Topic found");
        if let Err(err) = inner.admin.disconnect().await {
            warn!(topic = %topic, error = %err, "Failed to release metadata connection");
        }

        self.set_phase(ConsumerPhase::Connecting);
        let client = inner.connection.connect().await?;

        let start = StartPosition::from_beginning(inner.settings.from_beginning);
        client.subscribe(&[topic.to_string()], start).await?;
        self.set_phase(ConsumerPhase::Subscribed);
        info!(
            topic = %topic,
            instance = %inner.instance_id,
            start = start.as_str(),
            "Subscribed to topic"
        );

        self.set_phase(ConsumerPhase::Running);
        let exit = self.process(&client, handler).await;

        if let CycleExit::Stopped = exit {
            if let Err(err) = client.unsubscribe().await {
                warn!(topic = %topic, error = %err, "Unsubscribe failed");
            }
        }
        Ok(exit)
    }

    /// 探测 topic 是否存在
    ///
    /// 最多 `max_probe_attempts` 次，每次间隔 `probe_delay`；耗尽后返回致命错误
    pub async fn probe_topic(&self, topic: &str) -> Result<TopicProbeResult> {
        let inner = &self.inner;
        let policy = &inner.probe_policy;
        let max_attempts = policy.max_attempts().unwrap_or(1);

        for attempt in 1..=max_attempts {
            let (epoch, client) = inner.admin.connect_with_epoch().await?;
            match client.topic_exists(topic).await {
                Ok(true) => return Ok(TopicProbeResult { exists: true, attempt }),
                Ok(false) => {
                    info!(topic = %topic, attempt, max_attempts, "Topic not found yet");
                }
                Err(err) if err.is_retryable() => {
                    warn!(topic = %topic, attempt, error = %err, "Topic metadata query failed");
                    inner.admin.mark_stale(epoch);
                }
                Err(err) => return Err(err.into_fatal()),
            }

            if attempt < max_attempts {
                inner.scheduler.sleep(policy.backoff_duration(attempt - 1)).await?;
            }
        }

        error!(topic = %topic, attempts = max_attempts, "Topic does not exist, giving up");
        Err(MessagingError::topic_not_found(topic, max_attempts))
    }

    async fn process<H: MessageHandler>(&self, client: &C::Client, handler: &Arc<H>) -> CycleExit {
        let inner = &self.inner;
        let settings = &inner.settings;
        let token = inner.scheduler.token();

        let tracker = Arc::new(OffsetTracker::new());
        let (completions, mut completed) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            semaphore: Arc::new(Semaphore::new(settings.partition_concurrency.max(1))),
            tracker: Arc::clone(&tracker),
            stats: inner.stats.clone(),
            completions,
            token: token.clone(),
        };

        let mut workers: HashMap<TopicPartition, PartitionWorker> = HashMap::new();
        let mut commit_policy = CommitPolicy::new(settings.commit_threshold);
        let commit_interval = settings.commit_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + commit_interval, commit_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut processed: u64 = 0;

        let failure = loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    info!("Shutdown requested, draining partition workers");
                    break None;
                }

                Some(()) = completed.recv() => {
                    processed += 1;
                    if commit_policy.record_completion()
                        && self.commit(client, &tracker, CommitTrigger::Threshold).await
                    {
                        commit_policy.reset();
                        ticker.reset();
                    }
                }

                // 提交失败的位置在之后的 tick 中重试，不依赖新的完成记录
                _ = ticker.tick() => {
                    if self.commit(client, &tracker, CommitTrigger::Interval).await {
                        commit_policy.reset();
                    }
                }

                received = client.recv() => match received {
                    Ok(record) => {
                        let tp = record.topic_partition();
                        let worker = workers.entry(tp.clone()).or_insert_with(|| {
                            PartitionWorker::spawn(
                                tp,
                                Arc::clone(handler),
                                ctx.clone(),
                                settings.partition_buffer,
                            )
                        });
                        if let Err(err) = worker.send(record).await {
                            let record = err.0;
                            error!(
                                topic = %record.topic,
                                partition = record.partition,
                                offset = record.offset,
                                "Partition worker is gone, record not dispatched"
                            );
                        }
                    }
                    Err(err) => break Some(err),
                },
            }
        };

        // 等待已派发的记录处理完毕
        for (_, worker) in workers.drain() {
            worker.shutdown().await;
        }
        drop(ctx);
        while completed.recv().await.is_some() {
            processed += 1;
        }
        self.commit(client, &tracker, CommitTrigger::Drain).await;

        match failure {
            None => CycleExit::Stopped,
            Some(error) => CycleExit::Crashed { error, processed },
        }
    }

    /// 提交已完成的位置，没有待提交位置时视为成功
    async fn commit(&self, client: &C::Client, tracker: &OffsetTracker, trigger: CommitTrigger) -> bool {
        let positions = tracker.pending_commits();
        if positions.is_empty() {
            return true;
        }

        let result = match trigger {
            CommitTrigger::Drain => client.commit_sync(&positions).await,
            CommitTrigger::Interval | CommitTrigger::Threshold => client.commit(&positions).await,
        };
        match result {
            Ok(()) => {
                tracker.mark_committed(&positions);
                debug!(partitions = positions.len(), reason = trigger.as_str(), "Offsets committed");
                true
            }
            Err(err) => {
                warn!(error = %err, reason = trigger.as_str(), "Offset commit failed");
                self.inner.stats.record_error().await;
                false
            }
        }
    }

    /// 停止消费并断开全部连接
    ///
    /// 正在执行的 handler 会被等待，最长 `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        inner.scheduler.cancel();

        let mut phases = inner.phase.subscribe();
        let stopped = matches!(
            tokio::time::timeout(timeout, phases.wait_for(|phase| *phase == ConsumerPhase::Idle)).await,
            Ok(Ok(_))
        );
        if !stopped {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Consumer did not stop within shutdown timeout, disconnecting anyway"
            );
        }

        let mut result = match lock(&inner.stop_error).take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        for manager in [&inner.admin, &inner.connection] {
            if !stopped || manager.is_active() {
                if let Err(err) = manager.disconnect().await {
                    result = Err(err);
                }
            }
        }
        result
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn phase(&self) -> ConsumerPhase {
        *self.inner.phase.borrow()
    }

    /// 订阅阶段变化
    pub fn phase_changes(&self) -> watch::Receiver<ConsumerPhase> {
        self.inner.phase.subscribe()
    }

    pub async fn stats(&self) -> ConsumerStats {
        self.inner.stats.snapshot().await
    }

    pub fn crash_state(&self) -> RetryState {
        lock(&self.inner.crash_state).clone()
    }

    /// 消费连接的重试状态
    pub fn retry_state(&self) -> RetryState {
        self.inner.connection.retry_state()
    }

    pub fn is_active(&self) -> bool {
        self.phase() != ConsumerPhase::Idle
            || self.inner.admin.is_active()
            || self.inner.connection.is_active()
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.inner.connection
    }

    pub fn attach_health(&self, health: HealthService) {
        self.inner.connection.attach_health(health);
    }

    fn set_phase(&self, phase: ConsumerPhase) {
        let previous = self.inner.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Consumer phase changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::memory::{InMemoryBroker, MemoryConsumerConnector};
    use serde_json::Value;

    fn consumer(broker: &InMemoryBroker, settings: ConsumerSettings) -> Consumer<MemoryConsumerConnector> {
        let policy = ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2.0)
            .with_max_retries(3);
        Consumer::new(
            broker.consumer_connector("test-group"),
            Arc::new(policy),
            &RetryScheduler::new(),
            settings,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn missing_topic_probes_exactly_max_attempts() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(
            &broker,
            ConsumerSettings {
                max_probe_attempts: 4,
                probe_delay: Duration::from_millis(500),
                ..Default::default()
            },
        );

        let handler = handler_fn(|_: Value| async { Ok(()) });
        let err = consumer.run("missing-topic", handler).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::TopicNotFound);
        assert_eq!(broker.probe_calls(), 4);
        assert_eq!(consumer.phase(), ConsumerPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_reports_attempt_when_topic_appears() {
        let broker = InMemoryBroker::new();
        broker.create_topic_after_probes("orders", 1, 2);
        let consumer = consumer(
            &broker,
            ConsumerSettings {
                max_probe_attempts: 5,
                probe_delay: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let probe = consumer.probe_topic("orders").await.unwrap();
        assert_eq!(probe, TopicProbeResult { exists: true, attempt: 3 });
    }

    #[tokio::test]
    async fn empty_topic_is_rejected() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, ConsumerSettings::default());
        let err = consumer
            .run("", handler_fn(|_: Value| async { Ok(()) }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[tokio::test]
    async fn shutdown_before_run_is_clean() {
        let broker = InMemoryBroker::new();
        let consumer = consumer(&broker, ConsumerSettings::default());
        consumer.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(!consumer.is_active());
        assert_eq!(broker.connect_calls(), 0);
        assert!(consumer.instance_id().starts_with("consumer-"));
    }
}
