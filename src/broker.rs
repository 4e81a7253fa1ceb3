//! Broker 客户端抽象
//!
//! 连接管理、生产者与消费者只依赖这里的 trait，
//! rdkafka 实现位于 `kafka` 模块（feature `kafka`），测试使用 `memory` 模块

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ============================================================================
// 记录类型
// ============================================================================

/// 待发送记录
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// 发送确认后的投递元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 消费到的记录，投递后不可变
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: Option<DateTime<Utc>>,
    pub size: usize,
}

impl InboundRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// key 的 UTF-8 视图
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// topic + partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// 待提交位置
///
/// `offset` 为 handler 已返回的最高记录 offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 订阅起始位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// 最早保留的 offset
    Earliest,
    /// 仅新写入的记录
    Latest,
}

impl StartPosition {
    pub fn from_beginning(from_beginning: bool) -> Self {
        if from_beginning {
            StartPosition::Earliest
        } else {
            StartPosition::Latest
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StartPosition::Earliest => "earliest",
            StartPosition::Latest => "latest",
        }
    }
}

// ============================================================================
// 客户端 trait
// ============================================================================

/// 建立和释放底层客户端
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;

    /// 用于日志与健康检查的名称
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Self::Client>;

    /// 释放客户端；`None` 表示当前没有活动连接，实现仍应释放自身持有的资源
    async fn disconnect(&self, client: Option<Self::Client>) -> Result<()>;
}

/// 生产者客户端
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// 发送一条记录，在 broker 按配置的 acks 级别确认后返回
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryMetadata>;
}

/// topic 元数据查询
#[async_trait]
pub trait TopicMetadata: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool>;
}

/// 消费者客户端
#[async_trait]
pub trait ConsumerClient: TopicMetadata {
    async fn subscribe(&self, topics: &[String], start: StartPosition) -> Result<()>;

    /// 等待下一条记录，可安全地在 `select!` 中取消
    async fn recv(&self) -> Result<InboundRecord>;

    async fn commit(&self, positions: &[CommitPosition]) -> Result<()>;

    /// 等待 broker 确认的提交，用于关闭前的最后一次提交
    async fn commit_sync(&self, positions: &[CommitPosition]) -> Result<()> {
        self.commit(positions).await
    }

    async fn unsubscribe(&self) -> Result<()>;
}
