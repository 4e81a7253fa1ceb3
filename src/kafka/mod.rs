//! Kafka 客户端模块
//!
//! 基于 rdkafka 实现 `broker` 模块的连接器与客户端
//!
//! 此模块需要启用 `kafka` feature 才能使用

pub mod consumer_builder;
pub mod consumer_config;
pub mod producer_builder;
pub mod producer_config;

pub use consumer_builder::{KafkaConsumerClient, KafkaConsumerConnector, build_kafka_consumer};
pub use consumer_config::KafkaConsumerConfig;
pub use producer_builder::{KafkaProducerClient, KafkaProducerConnector, build_kafka_producer};
pub use producer_config::KafkaProducerConfig;

use rdkafka::metadata::Metadata;
use tokio::task;

use crate::error::{MessagingError, Result};

/// 元数据中 `topic` 是否存在且有可用分区
pub(crate) fn metadata_has_topic(metadata: &Metadata, topic: &str) -> bool {
    metadata
        .topics()
        .iter()
        .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty())
}

/// 在阻塞线程池中执行 librdkafka 同步调用
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::result::Result<T, rdkafka::error::KafkaError> + Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(MessagingError::from)?
        .map_err(MessagingError::from)
}
