//! 消息处理器

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::broker::InboundRecord;

/// 消息处理器
///
/// 可能在不同分区上被并发调用；同一分区内按 offset 顺序调用
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// 记录负载反序列化的目标类型
    type Payload: DeserializeOwned + Send + 'static;

    async fn handle(&self, payload: Self::Payload, record: &InboundRecord) -> anyhow::Result<()>;
}

/// 闭包处理器，见 [`handler_fn`]
pub struct HandlerFn<F, T> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

/// 用闭包构造处理器
///
/// ```ignore
/// let handler = handler_fn(|order: OrderCreated| async move {
///     info!(order_id = %order.id, "Assigning driver");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut, T>(f: F) -> HandlerFn<F, T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    HandlerFn {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> MessageHandler for HandlerFn<F, T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    type Payload = T;

    async fn handle(&self, payload: T, _record: &InboundRecord) -> anyhow::Result<()> {
        (self.f)(payload).await
    }
}
