//! Kafka 生产者构建器与客户端

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, info, warn};

use super::producer_config::KafkaProducerConfig;
use super::{blocking, metadata_has_topic};
use crate::broker::{Connector, DeliveryMetadata, OutboundRecord, ProducerClient, TopicMetadata};
use crate::config::Acks;
use crate::error::{MessagingError, Result};

/// 构建 Kafka 生产者
///
/// 启用幂等性时 acks 强制为 `all`
pub fn build_kafka_producer(
    config: &dyn KafkaProducerConfig,
) -> std::result::Result<FutureProducer, rdkafka::error::KafkaError> {
    let acks = if config.enable_idempotence() {
        Acks::All
    } else {
        config.acks()
    };

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", config.kafka_bootstrap())
        .set("client.id", config.client_id())
        .set("message.timeout.ms", config.message_timeout_ms().to_string())
        .set("enable.idempotence", config.enable_idempotence().to_string())
        .set("acks", acks.as_kafka_value())
        .set("compression.type", config.compression_type())
        .set("linger.ms", config.linger_ms().to_string())
        .set("metadata.max.age.ms", config.metadata_max_age_ms().to_string())
        .create()?;

    info!(
        bootstrap = %config.kafka_bootstrap(),
        timeout_ms = config.message_timeout_ms(),
        idempotence = config.enable_idempotence(),
        acks = acks.as_kafka_value(),
        "Kafka producer created"
    );

    Ok(producer)
}

/// Kafka 生产者连接器
#[derive(Clone)]
pub struct KafkaProducerConnector {
    config: Arc<dyn KafkaProducerConfig>,
}

impl KafkaProducerConnector {
    pub fn new(config: Arc<dyn KafkaProducerConfig>) -> Self {
        Self { config }
    }

    fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.config.metadata_timeout_ms())
    }
}

/// Kafka 生产者客户端
#[derive(Clone)]
pub struct KafkaProducerClient {
    producer: FutureProducer,
    queue_timeout: Duration,
    metadata_timeout: Duration,
}

#[async_trait]
impl Connector for KafkaProducerConnector {
    type Client = KafkaProducerClient;

    fn name(&self) -> &str {
        "kafka-producer"
    }

    async fn connect(&self) -> Result<KafkaProducerClient> {
        let producer = build_kafka_producer(self.config.as_ref())?;

        // librdkafka 惰性连接，通过元数据请求确认 broker 可达
        let timeout = self.metadata_timeout();
        let probe = producer.clone();
        blocking(move || probe.client().fetch_metadata(None, timeout).map(|_| ())).await?;

        debug!(bootstrap = %self.config.kafka_bootstrap(), "Kafka producer reached broker");
        Ok(KafkaProducerClient {
            producer,
            queue_timeout: Duration::from_millis(self.config.message_timeout_ms()),
            metadata_timeout: timeout,
        })
    }

    async fn disconnect(&self, client: Option<KafkaProducerClient>) -> Result<()> {
        let Some(client) = client else {
            return Ok(());
        };

        let timeout = client.queue_timeout;
        let producer = client.producer;
        let flushed = blocking(move || producer.flush(timeout)).await;
        if let Err(err) = &flushed {
            warn!(error = %err, "Kafka producer flush failed");
        }
        flushed
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryMetadata> {
        let mut future_record = FutureRecord::<str, [u8]>::to(&record.topic)
            .payload(record.payload.as_ref())
            .timestamp(record.timestamp.timestamp_millis());
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        match self
            .producer
            .send(future_record, Timeout::After(self.queue_timeout))
            .await
        {
            Ok(delivery) => Ok(DeliveryMetadata {
                topic: record.topic.clone(),
                partition: delivery.partition,
                offset: delivery.offset,
            }),
            Err((err, _message)) => Err(MessagingError::from(err)),
        }
    }
}

#[async_trait]
impl TopicMetadata for KafkaProducerClient {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;
        let topic = topic.to_string();
        blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata_has_topic(&metadata, &topic))
        })
        .await
    }
}
