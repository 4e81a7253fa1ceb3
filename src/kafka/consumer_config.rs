//! Kafka 消费者配置 Trait
//!
//! 定义构建 Kafka 消费者所需的配置接口，允许不同服务提供自己的配置实现

use crate::config::MessagingConfig;

/// Kafka 消费者配置 Trait
///
/// 任何需要构建 Kafka 消费者的服务配置都应该实现此 trait
pub trait KafkaConsumerConfig: Send + Sync {
    /// Kafka Bootstrap Servers 地址
    fn kafka_bootstrap(&self) -> &str;

    /// Consumer Group ID
    fn consumer_group(&self) -> &str;

    fn client_id(&self) -> &str;

    /// 会话超时（毫秒），默认 30000
    fn session_timeout_ms(&self) -> u64 {
        30000
    }

    /// 心跳间隔（毫秒），默认 3000
    fn heartbeat_interval_ms(&self) -> u64 {
        3000
    }

    /// 无已提交 offset 时是否从最早位置开始，默认 true
    fn from_beginning(&self) -> bool {
        true
    }

    /// Offset 重置策略
    fn auto_offset_reset(&self) -> &str {
        if self.from_beginning() {
            "earliest"
        } else {
            "latest"
        }
    }

    /// 最大消息大小（字节），默认 10MB
    fn fetch_message_max_bytes(&self) -> usize {
        10 * 1024 * 1024
    }

    /// 元数据最大年龄（毫秒），默认 5 分钟
    fn metadata_max_age_ms(&self) -> u64 {
        300000
    }

    /// topic 元数据查询超时（毫秒）
    fn metadata_timeout_ms(&self) -> u64 {
        5000
    }
}

impl KafkaConsumerConfig for MessagingConfig {
    fn kafka_bootstrap(&self) -> &str {
        &self.brokers
    }

    fn consumer_group(&self) -> &str {
        &self.group_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn session_timeout_ms(&self) -> u64 {
        self.session_timeout.0.as_millis() as u64
    }

    fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval.0.as_millis() as u64
    }

    fn from_beginning(&self) -> bool {
        self.from_beginning
    }
}
