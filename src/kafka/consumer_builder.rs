//! Kafka 消费者构建器与客户端

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::consumer_config::KafkaConsumerConfig;
use super::{blocking, metadata_has_topic};
use crate::broker::{
    CommitPosition, Connector, ConsumerClient, InboundRecord, StartPosition, TopicMetadata,
};
use crate::error::{MessagingError, Result};

/// 构建 Kafka 消费者
///
/// offset 由消费者在 handler 返回后手动提交，自动提交始终关闭
pub fn build_kafka_consumer(
    config: &dyn KafkaConsumerConfig,
) -> std::result::Result<StreamConsumer, rdkafka::error::KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", config.kafka_bootstrap())
        .set("group.id", config.consumer_group())
        .set("client.id", config.client_id())
        .set("enable.partition.eof", "false")
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", config.session_timeout_ms().to_string())
        .set("heartbeat.interval.ms", config.heartbeat_interval_ms().to_string())
        .set("auto.offset.reset", config.auto_offset_reset())
        .set("fetch.message.max.bytes", config.fetch_message_max_bytes().to_string())
        .set("metadata.max.age.ms", config.metadata_max_age_ms().to_string())
        .create()?;

    info!(
        bootstrap = %config.kafka_bootstrap(),
        group = %config.consumer_group(),
        offset_reset = %config.auto_offset_reset(),
        "Kafka consumer created"
    );

    Ok(consumer)
}

/// Kafka 消费者连接器
#[derive(Clone)]
pub struct KafkaConsumerConnector {
    config: Arc<dyn KafkaConsumerConfig>,
}

impl KafkaConsumerConnector {
    pub fn new(config: Arc<dyn KafkaConsumerConfig>) -> Self {
        Self { config }
    }
}

/// Kafka 消费者客户端
#[derive(Clone)]
pub struct KafkaConsumerClient {
    consumer: Arc<StreamConsumer>,
    metadata_timeout: Duration,
    offset_reset: String,
}

#[async_trait]
impl Connector for KafkaConsumerConnector {
    type Client = KafkaConsumerClient;

    fn name(&self) -> &str {
        "kafka-consumer"
    }

    async fn connect(&self) -> Result<KafkaConsumerClient> {
        let consumer = Arc::new(build_kafka_consumer(self.config.as_ref())?);
        let timeout = Duration::from_millis(self.config.metadata_timeout_ms());

        let probe = Arc::clone(&consumer);
        blocking(move || probe.fetch_metadata(None, timeout).map(|_| ())).await?;

        debug!(group = %self.config.consumer_group(), "Kafka consumer reached broker");
        Ok(KafkaConsumerClient {
            consumer,
            metadata_timeout: timeout,
            offset_reset: self.config.auto_offset_reset().to_string(),
        })
    }

    async fn disconnect(&self, client: Option<KafkaConsumerClient>) -> Result<()> {
        if let Some(client) = client {
            // 离开消费组，剩余资源在最后一个句柄释放时回收
            client.consumer.unsubscribe();
        }
        Ok(())
    }
}

#[async_trait]
impl TopicMetadata for KafkaConsumerClient {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.metadata_timeout;
        let topic = topic.to_string();
        blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata_has_topic(&metadata, &topic))
        })
        .await
    }
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    async fn subscribe(&self, topics: &[String], start: StartPosition) -> Result<()> {
        if start.as_str() != self.offset_reset {
            warn!(
                requested = start.as_str(),
                configured = %self.offset_reset,
                "Start position is fixed when the consumer is created, using configured value"
            );
        }

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        Ok(())
    }

    async fn recv(&self) -> Result<InboundRecord> {
        let message = self.consumer.recv().await?;
        let value = message.payload().map(Bytes::copy_from_slice).unwrap_or_default();
        let key = message.key().map(Bytes::copy_from_slice);

        Ok(InboundRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            size: value.len() + key.as_ref().map_or(0, Bytes::len),
            key,
            value,
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        })
    }

    async fn commit(&self, positions: &[CommitPosition]) -> Result<()> {
        let tpl = commit_list(positions)?;
        self.consumer.commit(&tpl, CommitMode::Async)?;
        Ok(())
    }

    async fn commit_sync(&self, positions: &[CommitPosition]) -> Result<()> {
        let tpl = commit_list(positions)?;
        let consumer = Arc::clone(&self.consumer);
        blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

fn commit_list(positions: &[CommitPosition]) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    for position in positions {
        // Kafka 提交的是下一条待读取的 offset
        tpl.add_partition_offset(&position.topic, position.partition, Offset::Offset(position.offset + 1))
            .map_err(MessagingError::from)?;
    }
    Ok(tpl)
}
