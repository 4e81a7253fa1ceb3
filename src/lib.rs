//! Flare MQ Client Library
//!
//! 具备自动重连、分区有序处理与优雅关闭的 Kafka 消息客户端层。
//!
//! - [`retry`]：重试策略与可取消的重试计时器
//! - [`connection`]：连接管理，合并并发连接请求
//! - [`producer`] / [`consumer`]：生产者与消费者
//! - [`runtime`]：进程级关闭协调
//! - [`memory`]：内存 broker，用于测试与本地开发
//! - `kafka`（feature = "kafka"）：基于 librdkafka 的连接器

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod health;
pub mod memory;
pub mod producer;
pub mod retry;
pub mod runtime;
pub mod telemetry;

// Kafka 连接器（可选）
#[cfg(feature = "kafka")]
pub mod kafka;

// Re-exports
pub use broker::{
    CommitPosition, Connector, ConsumerClient, DeliveryMetadata, InboundRecord, OutboundRecord,
    ProducerClient, StartPosition, TopicMetadata, TopicPartition,
};
pub use config::{Acks, ConfigError, EnvMsDuration, MessagingConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{
    Consumer, ConsumerPhase, ConsumerSettings, ConsumerStats, HandlerFn, MessageHandler,
    TopicProbeResult, handler_fn,
};
pub use error::{ErrorCategory, ErrorCode, MessagingError, ProduceError, Result};
pub use health::{HealthService, HealthStatus};
pub use memory::InMemoryBroker;
pub use producer::{Producer, ProducerSettings};
pub use retry::{
    ExponentialBackoffPolicy, FixedRetryPolicy, RetryDecision, RetryPolicy, RetryScheduler,
    RetryState, retry_with_policy,
};
pub use runtime::{
    RuntimeConfig, ShutdownCoordinator, ShutdownHandle, ShutdownOutcome, ShutdownReport, consume,
    consume_or_exit,
};
pub use telemetry::init_tracing;

#[cfg(feature = "kafka")]
pub use kafka::{
    KafkaConsumerClient, KafkaConsumerConfig, KafkaConsumerConnector, KafkaProducerClient,
    KafkaProducerConfig, KafkaProducerConnector,
};
