//! Flare MQ Client 错误处理模块
//!
//! 提供统一的错误分类：连接错误、协议错误、序列化错误与致命错误，
//! 重试策略依据这里的分类决定重试还是终止

pub mod code;
pub mod conversions;
pub mod messaging_error;

// 重新导出公共类型
pub use code::{ErrorCategory, ErrorCode};
pub use messaging_error::{MessagingError, ProduceError, Result};
