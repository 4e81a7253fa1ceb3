//! Kafka 生产者配置 Trait
//!
//! 定义构建 Kafka 生产者所需的配置接口，允许不同服务提供自己的配置实现

use crate::config::{Acks, MessagingConfig};

/// Kafka 生产者配置 Trait
///
/// 任何需要构建 Kafka 生产者的服务配置都应该实现此 trait
pub trait KafkaProducerConfig: Send + Sync {
    /// Kafka Bootstrap Servers 地址
    fn kafka_bootstrap(&self) -> &str;

    fn client_id(&self) -> &str;

    /// 消息超时时间（毫秒），默认 5000
    fn message_timeout_ms(&self) -> u64 {
        5000
    }

    /// 是否启用幂等性，默认 true
    fn enable_idempotence(&self) -> bool {
        true
    }

    /// 确认级别，启用幂等性时强制为 `all`
    fn acks(&self) -> Acks {
        Acks::All
    }

    /// 压缩类型，默认 "snappy"
    /// 可选值: "none", "gzip", "snappy", "lz4", "zstd"
    fn compression_type(&self) -> &str {
        "snappy"
    }

    /// 批量发送延迟（毫秒），默认 10ms
    fn linger_ms(&self) -> u64 {
        10
    }

    /// 元数据最大年龄（毫秒），默认 5 分钟
    fn metadata_max_age_ms(&self) -> u64 {
        300000
    }

    /// 连接时元数据探测超时（毫秒）
    fn metadata_timeout_ms(&self) -> u64 {
        5000
    }
}

impl KafkaProducerConfig for MessagingConfig {
    fn kafka_bootstrap(&self) -> &str {
        &self.brokers
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn message_timeout_ms(&self) -> u64 {
        self.message_timeout.0.as_millis() as u64
    }

    fn enable_idempotence(&self) -> bool {
        self.idempotent_producer
    }

    fn acks(&self) -> Acks {
        self.acks
    }
}
