//! 消费统计

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// 最近延迟窗口大小
const LATENCY_WINDOW: usize = 1000;

/// 消费统计数据
#[derive(Debug, Clone)]
pub struct ConsumerStats {
    /// 已处理记录数（成功与失败都计入）
    pub messages_processed: u64,
    pub errors: u64,
    pub last_message_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub recent_latencies_ms: VecDeque<u64>,
}

impl ConsumerStats {
    fn new() -> Self {
        Self {
            messages_processed: 0,
            errors: 0,
            last_message_time: None,
            start_time: Utc::now(),
            recent_latencies_ms: VecDeque::with_capacity(LATENCY_WINDOW),
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.recent_latencies_ms.is_empty() {
            return None;
        }
        let total: u64 = self.recent_latencies_ms.iter().sum();
        Some(total as f64 / self.recent_latencies_ms.len() as f64)
    }
}

/// 统计收集器
#[derive(Debug, Clone)]
pub struct StatsCollector {
    stats: Arc<RwLock<ConsumerStats>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(ConsumerStats::new())),
        }
    }

    /// 记录一条已处理的记录
    pub async fn record_message(&self, success: bool, latency: Duration) {
        let mut stats = self.stats.write().await;
        stats.messages_processed += 1;
        if !success {
            stats.errors += 1;
        }
        stats.last_message_time = Some(Utc::now());

        stats.recent_latencies_ms.push_back(latency.as_millis() as u64);
        if stats.recent_latencies_ms.len() > LATENCY_WINDOW {
            stats.recent_latencies_ms.pop_front();
        }
    }

    /// 记录与单条记录无关的错误（接收失败、提交失败）
    pub async fn record_error(&self) {
        self.stats.write().await.errors += 1;
    }

    pub async fn snapshot(&self) -> ConsumerStats {
        self.stats.read().await.clone()
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
