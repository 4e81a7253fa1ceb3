//! offset 跟踪与提交策略
//!
//! 只有 handler 已返回的记录 offset 才会进入待提交集合，
//! 提交位置永远不会超过某分区已返回的最高 offset

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::broker::{CommitPosition, TopicPartition};

#[derive(Debug, Clone, Copy, Default)]
struct PartitionOffsets {
    completed: Option<i64>,
    committed: Option<i64>,
}

/// 每分区已完成 / 已提交 offset
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<TopicPartition, PartitionOffsets>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn partitions(&self) -> MutexGuard<'_, HashMap<TopicPartition, PartitionOffsets>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// handler 已返回（无论成功与否）
    pub fn complete(&self, tp: &TopicPartition, offset: i64) {
        let mut partitions = self.partitions();
        let entry = partitions.entry(tp.clone()).or_default();
        entry.completed = Some(entry.completed.map_or(offset, |c| c.max(offset)));
    }

    pub fn completed(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions().get(tp).and_then(|p| p.completed)
    }

    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions().get(tp).and_then(|p| p.committed)
    }

    /// 已完成但尚未提交的位置
    pub fn pending_commits(&self) -> Vec<CommitPosition> {
        let mut positions: Vec<CommitPosition> = self
            .partitions()
            .iter()
            .filter_map(|(tp, offsets)| {
                let completed = offsets.completed?;
                if offsets.committed.is_some_and(|committed| committed >= completed) {
                    return None;
                }
                Some(CommitPosition {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: completed,
                })
            })
            .collect();
        positions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        positions
    }

    pub fn mark_committed(&self, positions: &[CommitPosition]) {
        let mut partitions = self.partitions();
        for position in positions {
            let entry = partitions
                .entry(TopicPartition::new(position.topic.clone(), position.partition))
                .or_default();
            entry.committed = Some(entry.committed.map_or(position.offset, |c| c.max(position.offset)));
        }
    }
}

/// 提交阈值计数
///
/// 自上次提交以来完成 `threshold` 条记录时触发提交；时间间隔由运行循环负责
#[derive(Debug, Clone)]
pub struct CommitPolicy {
    threshold: u64,
    pending: u64,
}

impl CommitPolicy {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: 0,
        }
    }

    /// 记录一次完成，返回是否达到阈值
    pub fn record_completion(&mut self) -> bool {
        self.pending += 1;
        self.pending >= self.threshold
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn reset(&mut self) {
        self.pending = 0;
    }
}
