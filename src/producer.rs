//! 生产者
//!
//! 发送前确保连接；可重试的 broker 错误会标记连接失效并按策略重连重发，
//! 不可重试错误直接返回调用方。仅在 broker 确认后返回投递元数据。
//!
//! 启用幂等时，确认超时这类结果不确定的失败不会重建客户端再重发：
//! 幂等去重只在同一个生产者会话内有效，librdkafka 已在 `message.timeout.ms`
//! 内完成内部重试，应用层重发可能产生重复记录。

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::{Connector, DeliveryMetadata, OutboundRecord, ProducerClient};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{ProduceError, Result};
use crate::health::HealthService;
use crate::retry::{RetryPolicy, RetryScheduler, retry_with_policy};

/// 生产者设置
#[derive(Debug, Clone, Default)]
pub struct ProducerSettings {
    /// 调用方未指定 topic 时使用
    pub default_topic: Option<String>,
    /// 与底层客户端的 `enable.idempotence` 保持一致
    pub idempotent: bool,
}

/// 生产者
pub struct Producer<C: Connector> {
    connection: ConnectionManager<C>,
    policy: Arc<dyn RetryPolicy>,
    settings: ProducerSettings,
}

impl<C: Connector> Clone for Producer<C> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            policy: Arc::clone(&self.policy),
            settings: self.settings.clone(),
        }
    }
}

impl<C> Producer<C>
where
    C: Connector,
    C::Client: ProducerClient,
{
    pub fn new(
        connector: C,
        policy: Arc<dyn RetryPolicy>,
        scheduler: &RetryScheduler,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            connection: ConnectionManager::new(connector, Arc::clone(&policy), scheduler.child()),
            policy,
            settings,
        }
    }

    /// 序列化为 JSON 并发送到 `topic`（为空时使用默认 topic）
    pub async fn send<T>(&self, topic: &str, message: &T) -> std::result::Result<DeliveryMetadata, ProduceError>
    where
        T: Serialize + ?Sized,
    {
        self.send_keyed(topic, None, message).await
    }

    /// 带 key 发送，相同 key 落在同一分区
    pub async fn send_keyed<T>(
        &self,
        topic: &str,
        key: Option<&str>,
        message: &T,
    ) -> std::result::Result<DeliveryMetadata, ProduceError>
    where
        T: Serialize + ?Sized,
    {
        let topic = self.resolve_topic(topic)?;
        let payload = serde_json::to_vec(message).map_err(|err| ProduceError::Serialization {
            topic: topic.clone(),
            reason: err.to_string(),
        })?;

        let record = OutboundRecord {
            topic: topic.clone(),
            key: key.map(str::to_owned),
            payload: Bytes::from(payload),
            timestamp: Utc::now(),
        };

        let started = Instant::now();
        let result = retry_with_policy(
            self.policy.as_ref(),
            self.connection.scheduler(),
            "produce",
            |_| self.deliver(record.clone()),
            |attempt, delay| {
                debug!(
                    topic = %topic,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Resending after broker error"
                );
            },
        )
        .await;

        match result {
            Ok(metadata) => {
                info!(
                    topic = %metadata.topic,
                    partition = metadata.partition,
                    offset = metadata.offset,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Message produced"
                );
                Ok(metadata)
            }
            Err(source) => {
                error!(
                    topic = %topic,
                    error = %source,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Failed to produce message"
                );
                Err(ProduceError::Delivery { topic, source })
            }
        }
    }

    async fn deliver(&self, record: OutboundRecord) -> Result<DeliveryMetadata> {
        let (epoch, client) = self.connection.connect_with_epoch().await?;
        let topic = record.topic.clone();
        match client.send(record).await {
            Ok(metadata) => Ok(metadata),
            Err(err) if self.settings.idempotent && err.code().is_ambiguous_delivery() => {
                // 保留当前会话，不重发
                warn!(topic = %topic, error = %err, "Delivery outcome unknown, not resending");
                Err(err.into_fatal())
            }
            Err(err) => {
                self.connection.mark_stale(epoch);
                Err(err)
            }
        }
    }

    fn resolve_topic(&self, topic: &str) -> std::result::Result<String, ProduceError> {
        if !topic.is_empty() {
            return Ok(topic.to_string());
        }

        match self.settings.default_topic.as_deref() {
            Some(default) if !default.is_empty() => Ok(default.to_string()),
            _ => Err(ProduceError::MissingTopic),
        }
    }

    /// 预先建立连接
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await.map(|_| ())
    }

    /// 刷新并断开连接
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    pub fn attach_health(&self, health: HealthService) {
        self.connection.attach_health(health);
    }
}
