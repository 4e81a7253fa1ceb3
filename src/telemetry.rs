//! 日志初始化
//!
//! 级别由 `RUST_LOG` 控制，未设置时为 `info`。

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::error::{MessagingError, Result};

/// 安装全局 tracing subscriber
///
/// `json` 为 true 时输出结构化 JSON，适合日志采集；重复安装返回配置错误。
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|err| MessagingError::configuration(format!("tracing already initialized: {err}")))
}
