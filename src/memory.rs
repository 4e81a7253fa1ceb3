//! 内存 broker
//!
//! 实现 `broker` 模块的全部 trait，支持故障注入，供测试和本地开发使用。
//! 每个消费组按单实例处理：组内消费者读取 topic 的全部分区。

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::broker::{
    CommitPosition, Connector, ConsumerClient, DeliveryMetadata, InboundRecord, OutboundRecord,
    ProducerClient, StartPosition, TopicMetadata, TopicPartition,
};
use crate::error::{ErrorCode, MessagingError, Result};

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: usize,
}

impl TopicLog {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions.max(1)],
            next_partition: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    connects: u32,
    sends: VecDeque<MessagingError>,
    recvs: u32,
    disconnects: u32,
    /// 写入成功但确认丢失的发送
    lost_acks: u32,
    commits: u32,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    /// topic -> (剩余探测次数, 分区数)
    delayed_topics: HashMap<String, (u32, usize)>,
    committed: HashMap<(String, TopicPartition), i64>,
    commit_log: Vec<(String, CommitPosition)>,
    faults: Faults,
    connect_latency: Duration,
    connect_calls: u32,
    disconnect_calls: u32,
    probe_calls: u32,
    send_calls: u32,
    commit_calls: u32,
    sync_commit_calls: u32,
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    records_available: Notify,
}

/// 内存 broker
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.inner.records_available.notify_waiters();
    }

    // ========================================================================
    // topic 管理
    // ========================================================================

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state();
        state.delayed_topics.remove(topic);
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions));
    }

    /// topic 在 `probes` 次元数据查询之后才出现
    pub fn create_topic_after_probes(&self, topic: &str, partitions: usize, probes: u32) {
        if probes == 0 {
            return self.create_topic(topic, partitions);
        }
        self.state()
            .delayed_topics
            .insert(topic.to_string(), (probes, partitions));
    }

    /// 直接写入原始字节，绕过生产者
    pub fn publish_raw(&self, topic: &str, partition: i32, key: Option<&str>, value: impl Into<Bytes>) -> Result<DeliveryMetadata> {
        let record = StoredRecord {
            key: key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            value: value.into(),
            timestamp: Utc::now(),
        };
        let metadata = {
            let mut state = self.state();
            let log = state.topics.get_mut(topic).ok_or_else(|| unknown_topic(topic))?;
            let slot = usize::try_from(partition)
                .ok()
                .and_then(|p| log.partitions.get_mut(p))
                .ok_or_else(|| unknown_topic(topic))?;
            slot.push(record);
            DeliveryMetadata {
                topic: topic.to_string(),
                partition,
                offset: (slot.len() - 1) as i64,
            }
        };
        self.wake();
        Ok(metadata)
    }

    pub fn records(&self, topic: &str, partition: i32) -> Vec<InboundRecord> {
        let state = self.state();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        let Some(records) = usize::try_from(partition).ok().and_then(|p| log.partitions.get(p)) else {
            return Vec::new();
        };
        records
            .iter()
            .enumerate()
            .map(|(offset, stored)| to_inbound(topic, partition, offset as i64, stored))
            .collect()
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), TopicPartition::new(topic, partition)))
            .copied()
    }

    /// 按时间顺序记录的全部提交
    pub fn commit_log(&self, group: &str) -> Vec<CommitPosition> {
        self.state()
            .commit_log
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, position)| position.clone())
            .collect()
    }

    // ========================================================================
    // 故障注入
    // ========================================================================

    pub fn fail_next_connects(&self, count: u32) {
        self.state().faults.connects = count;
    }

    /// 接下来 `count` 次发送返回可重试的连接错误
    pub fn fail_next_sends(&self, count: u32) {
        let mut state = self.state();
        for _ in 0..count {
            state
                .faults
                .sends
                .push_back(MessagingError::connection_with(ErrorCode::ConnectionClosed, "broker connection reset"));
        }
    }

    /// 下一次发送返回指定错误
    pub fn reject_next_send(&self, error: MessagingError) {
        self.state().faults.sends.push_back(error);
    }

    /// 下一次发送写入日志，但调用方收到确认超时
    pub fn lose_next_ack(&self) {
        self.state().faults.lost_acks += 1;
    }

    /// 接下来 `count` 次 offset 提交返回连接错误
    pub fn fail_next_commits(&self, count: u32) {
        self.state().faults.commits = count;
    }

    /// 接下来 `count` 次接收返回连接错误，等待中的接收也会被唤醒
    pub fn fail_next_recv(&self, count: u32) {
        self.state().faults.recvs = count;
        self.wake();
    }

    pub fn fail_next_disconnect(&self) {
        self.state().faults.disconnects += 1;
    }

    pub fn set_connect_latency(&self, latency: Duration) {
        self.state().connect_latency = latency;
    }

    pub fn connect_calls(&self) -> u32 {
        self.state().connect_calls
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state().disconnect_calls
    }

    pub fn probe_calls(&self) -> u32 {
        self.state().probe_calls
    }

    pub fn send_calls(&self) -> u32 {
        self.state().send_calls
    }

    /// 全部提交调用次数，包括失败的
    pub fn commit_calls(&self) -> u32 {
        self.state().commit_calls
    }

    pub fn sync_commit_calls(&self) -> u32 {
        self.state().sync_commit_calls
    }

    // ========================================================================
    // 连接器
    // ========================================================================

    pub fn producer_connector(&self) -> MemoryProducerConnector {
        MemoryProducerConnector {
            broker: self.clone(),
        }
    }

    pub fn consumer_connector(&self, group: impl Into<String>) -> MemoryConsumerConnector {
        MemoryConsumerConnector {
            broker: self.clone(),
            group: group.into(),
        }
    }

    async fn open(&self) -> Result<()> {
        let latency = {
            let mut state = self.state();
            state.connect_calls += 1;
            state.connect_latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if state.faults.connects > 0 {
            state.faults.connects -= 1;
            return Err(MessagingError::connection("connection refused"));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state();
        state.disconnect_calls += 1;
        if state.faults.disconnects > 0 {
            state.faults.disconnects -= 1;
            return Err(MessagingError::connection_with(
                ErrorCode::ConnectionClosed,
                "disconnect failed",
            ));
        }
        Ok(())
    }

    fn append(&self, record: OutboundRecord) -> Result<DeliveryMetadata> {
        let (metadata, ack_lost) = {
            let mut state = self.state();
            state.send_calls += 1;
            if let Some(err) = state.faults.sends.pop_front() {
                return Err(err);
            }
            let ack_lost = state.faults.lost_acks > 0;
            if ack_lost {
                state.faults.lost_acks -= 1;
            }

            let log = state
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| unknown_topic(&record.topic))?;
            let partition = match &record.key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % log.partitions.len() as u64) as usize
                }
                None => {
                    let partition = log.next_partition % log.partitions.len();
                    log.next_partition = log.next_partition.wrapping_add(1);
                    partition
                }
            };

            let slot = &mut log.partitions[partition];
            slot.push(StoredRecord {
                key: record.key.map(Bytes::from),
                value: record.payload,
                timestamp: record.timestamp,
            });
            let metadata = DeliveryMetadata {
                topic: record.topic,
                partition: partition as i32,
                offset: (slot.len() - 1) as i64,
            };
            (metadata, ack_lost)
        };
        self.wake();

        if ack_lost {
            return Err(MessagingError::protocol(
                ErrorCode::DeliveryTimedOut,
                format!("delivery acknowledgement for {} timed out", metadata.topic),
            ));
        }
        Ok(metadata)
    }

    fn record_commit(&self, group: &str, positions: &[CommitPosition], sync: bool) -> Result<()> {
        let mut state = self.state();
        state.commit_calls += 1;
        if state.faults.commits > 0 {
            state.faults.commits -= 1;
            return Err(MessagingError::protocol(
                ErrorCode::CoordinatorNotAvailable,
                "group coordinator not available",
            ));
        }
        if sync {
            state.sync_commit_calls += 1;
        }
        for position in positions {
            let tp = TopicPartition::new(position.topic.clone(), position.partition);
            state.committed.insert((group.to_string(), tp), position.offset);
            state.commit_log.push((group.to_string(), position.clone()));
        }
        Ok(())
    }

    fn probe(&self, topic: &str) -> bool {
        let mut state = self.state();
        state.probe_calls += 1;
        if state.topics.contains_key(topic) {
            return true;
        }

        let Some((remaining, partitions)) = state.delayed_topics.get_mut(topic) else {
            return false;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            let partitions = *partitions;
            state.delayed_topics.remove(topic);
            state.topics.insert(topic.to_string(), TopicLog::new(partitions));
        }
        false
    }
}

fn unknown_topic(topic: &str) -> MessagingError {
    MessagingError::protocol(
        ErrorCode::UnknownTopicOrPartition,
        format!("unknown topic or partition: {topic}"),
    )
}

fn to_inbound(topic: &str, partition: i32, offset: i64, stored: &StoredRecord) -> InboundRecord {
    InboundRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key.clone(),
        size: stored.value.len() + stored.key.as_ref().map_or(0, Bytes::len),
        value: stored.value.clone(),
        timestamp: Some(stored.timestamp),
    }
}

// ============================================================================
// 生产者
// ============================================================================

/// 内存生产者连接器
#[derive(Debug, Clone)]
pub struct MemoryProducerConnector {
    broker: InMemoryBroker,
}

/// 内存生产者客户端
#[derive(Debug, Clone)]
pub struct MemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl Connector for MemoryProducerConnector {
    type Client = MemoryProducer;

    fn name(&self) -> &str {
        "memory-producer"
    }

    async fn connect(&self) -> Result<MemoryProducer> {
        self.broker.open().await?;
        Ok(MemoryProducer {
            broker: self.broker.clone(),
        })
    }

    async fn disconnect(&self, _client: Option<MemoryProducer>) -> Result<()> {
        self.broker.close()
    }
}

#[async_trait]
impl ProducerClient for MemoryProducer {
    async fn send(&self, record: OutboundRecord) -> Result<DeliveryMetadata> {
        self.broker.append(record)
    }
}

#[async_trait]
impl TopicMetadata for MemoryProducer {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        Ok(self.broker.probe(topic))
    }
}

// ============================================================================
// 消费者
// ============================================================================

/// 内存消费者连接器
#[derive(Debug, Clone)]
pub struct MemoryConsumerConnector {
    broker: InMemoryBroker,
    group: String,
}

#[derive(Debug, Default)]
struct Cursor {
    /// 下一条待读取的 offset
    positions: Vec<(TopicPartition, i64)>,
    next: usize,
}

/// 内存消费者客户端
#[derive(Debug, Clone)]
pub struct MemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    cursor: Arc<Mutex<Cursor>>,
}

impl MemoryConsumer {
    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 按分区轮询取下一条记录
    fn poll(&self) -> Result<Option<InboundRecord>> {
        let mut state = self.broker.state();
        if state.faults.recvs > 0 {
            state.faults.recvs -= 1;
            return Err(MessagingError::connection_with(
                ErrorCode::ConnectionClosed,
                "broker connection lost",
            ));
        }

        let mut cursor = self.cursor();
        let count = cursor.positions.len();
        for step in 0..count {
            let index = (cursor.next + step) % count;
            let (tp, position) = &cursor.positions[index];
            let stored = state
                .topics
                .get(&tp.topic)
                .and_then(|log| log.partitions.get(tp.partition as usize))
                .and_then(|records| records.get(*position as usize));

            if let Some(stored) = stored {
                let record = to_inbound(&tp.topic, tp.partition, *position, stored);
                cursor.positions[index].1 += 1;
                cursor.next = (index + 1) % count;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Connector for MemoryConsumerConnector {
    type Client = MemoryConsumer;

    fn name(&self) -> &str {
        "memory-consumer"
    }

    async fn connect(&self) -> Result<MemoryConsumer> {
        self.broker.open().await?;
        Ok(MemoryConsumer {
            broker: self.broker.clone(),
            group: self.group.clone(),
            cursor: Arc::new(Mutex::new(Cursor::default())),
        })
    }

    async fn disconnect(&self, client: Option<MemoryConsumer>) -> Result<()> {
        if let Some(client) = client {
            client.cursor().positions.clear();
        }
        self.broker.close()
    }
}

#[async_trait]
impl TopicMetadata for MemoryConsumer {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        Ok(self.broker.probe(topic))
    }
}

#[async_trait]
impl ConsumerClient for MemoryConsumer {
    async fn subscribe(&self, topics: &[String], start: StartPosition) -> Result<()> {
        let state = self.broker.state();
        let mut positions = Vec::new();
        for topic in topics {
            let log = state.topics.get(topic).ok_or_else(|| unknown_topic(topic))?;
            for (partition, records) in log.partitions.iter().enumerate() {
                let tp = TopicPartition::new(topic.clone(), partition as i32);
                let position = match state.committed.get(&(self.group.clone(), tp.clone())) {
                    Some(committed) => committed + 1,
                    None => match start {
                        StartPosition::Earliest => 0,
                        StartPosition::Latest => records.len() as i64,
                    },
                };
                positions.push((tp, position));
            }
        }

        let mut cursor = self.cursor();
        cursor.positions = positions;
        cursor.next = 0;
        Ok(())
    }

    async fn recv(&self) -> Result<InboundRecord> {
        loop {
            let notified = self.broker.inner.records_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.poll()? {
                return Ok(record);
            }
            notified.await;
        }
    }

    async fn commit(&self, positions: &[CommitPosition]) -> Result<()> {
        self.broker.record_commit(&self.group, positions, false)
    }

    async fn commit_sync(&self, positions: &[CommitPosition]) -> Result<()> {
        self.broker.record_commit(&self.group, positions, true)
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.cursor().positions.clear();
        Ok(())
    }
}
