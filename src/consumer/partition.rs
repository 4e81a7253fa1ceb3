//! 分区 worker
//!
//! 每个分区一个 worker 任务和一个有界 channel：
//! - 同一分区内严格按 offset 顺序处理
//! - 跨分区并发，信号量限制同时执行的 handler 数量
//! - handler 返回（成功、失败或 panic）后记录完成 offset

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::handler::MessageHandler;
use super::offsets::OffsetTracker;
use super::stats::StatsCollector;
use crate::broker::{InboundRecord, TopicPartition};

/// worker 共享的运行时资源
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub semaphore: Arc<Semaphore>,
    pub tracker: Arc<OffsetTracker>,
    pub stats: StatsCollector,
    pub completions: mpsc::UnboundedSender<()>,
    pub token: CancellationToken,
}

/// 单分区 worker
pub(crate) struct PartitionWorker {
    partition: TopicPartition,
    sender: mpsc::Sender<InboundRecord>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn spawn<H: MessageHandler>(
        partition: TopicPartition,
        handler: Arc<H>,
        ctx: WorkerContext,
        buffer: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let worker_partition = partition.clone();
        let handle = tokio::spawn(async move {
            run_worker(worker_partition, receiver, handler, ctx).await;
        });

        debug!(partition = %partition, "Partition worker started");
        Self {
            partition,
            sender,
            handle: Some(handle),
        }
    }

    /// 投递记录，channel 满时等待
    pub async fn send(&self, record: InboundRecord) -> Result<(), mpsc::error::SendError<InboundRecord>> {
        self.sender.send(record).await
    }

    /// 关闭 channel 并等待队列中的记录处理完毕
    pub async fn shutdown(mut self) {
        drop(self.sender);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(partition = %self.partition, error = %err, "Partition worker task failed");
            }
        }
    }
}

async fn run_worker<H: MessageHandler>(
    partition: TopicPartition,
    mut receiver: mpsc::Receiver<InboundRecord>,
    handler: Arc<H>,
    ctx: WorkerContext,
) {
    while let Some(record) = receiver.recv().await {
        if ctx.token.is_cancelled() {
            debug!(partition = %partition, offset = record.offset, "Shutdown requested, skipping queued record");
            continue;
        }

        let Ok(_permit) = ctx.semaphore.acquire().await else {
            break;
        };

        let started = Instant::now();
        let success = process_record(handler.as_ref(), &record).await;
        ctx.stats.record_message(success, started.elapsed()).await;

        ctx.tracker.complete(&partition, record.offset);
        let _ = ctx.completions.send(());
    }
    debug!(partition = %partition, "Partition worker stopped");
}

/// 反序列化并调用 handler，返回是否成功
async fn process_record<H: MessageHandler>(handler: &H, record: &InboundRecord) -> bool {
    let payload = match serde_json::from_slice::<H::Payload>(&record.value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "Skipping record with malformed payload"
            );
            return false;
        }
    };

    match AssertUnwindSafe(handler.handle(payload, record)).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %format!("{err:#}"),
                "Message handler failed"
            );
            false
        }
        Err(panic) => {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                panic = %panic_message(panic.as_ref()),
                "Message handler panicked"
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
