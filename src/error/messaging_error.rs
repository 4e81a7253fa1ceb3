//! 消息层统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 消息层统一错误类型
///
/// - `Connection`: broker 不可达等暂态故障，总是可重试
/// - `Protocol`: broker 拒绝请求，仅暂态代码可重试
/// - `Serialization`: 本地负载错误，从不重试
/// - `Fatal`: 认证失败、配置非法或重试预算耗尽，向上传播到进程级
/// - `Cancelled`: 等待被关闭信号打断
#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    #[error("connection error [{code}]: {reason}")]
    Connection { code: ErrorCode, reason: String },

    #[error("protocol error [{code}]: {reason}")]
    Protocol { code: ErrorCode, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("fatal error [{code}]: {reason}")]
    Fatal { code: ErrorCode, reason: String },

    #[error("operation cancelled: shutdown in progress")]
    Cancelled,
}

impl MessagingError {
    /// 创建连接错误（broker 不可用）
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::connection_with(ErrorCode::BrokerUnavailable, reason)
    }

    /// 使用指定代码创建连接错误
    pub fn connection_with(code: ErrorCode, reason: impl Into<String>) -> Self {
        MessagingError::Connection {
            code,
            reason: reason.into(),
        }
    }

    /// 创建 broker 协议错误
    pub fn protocol(code: ErrorCode, reason: impl Into<String>) -> Self {
        MessagingError::Protocol {
            code,
            reason: reason.into(),
        }
    }

    /// 创建序列化错误
    pub fn serialization(reason: impl Into<String>) -> Self {
        MessagingError::Serialization(reason.into())
    }

    /// 创建致命错误
    pub fn fatal(code: ErrorCode, reason: impl Into<String>) -> Self {
        MessagingError::Fatal {
            code,
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::fatal(ErrorCode::ConfigurationError, reason)
    }

    /// 创建认证失败错误
    pub fn authentication_failed(reason: impl Into<String>) -> Self {
        Self::fatal(ErrorCode::AuthenticationFailed, reason)
    }

    /// 重试预算耗尽
    pub fn retry_exhausted(operation: &str, attempts: u32, last: &MessagingError) -> Self {
        Self::fatal(
            ErrorCode::RetryBudgetExhausted,
            format!("{operation} gave up after {attempts} attempts: {last}"),
        )
    }

    /// topic 探测次数耗尽仍不存在
    pub fn topic_not_found(topic: &str, attempts: u32) -> Self {
        Self::fatal(
            ErrorCode::TopicNotFound,
            format!("topic '{topic}' not found after {attempts} probe attempts"),
        )
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            MessagingError::Connection { code, .. }
            | MessagingError::Protocol { code, .. }
            | MessagingError::Fatal { code, .. } => *code,
            MessagingError::Serialization(_) => ErrorCode::SerializationError,
            MessagingError::Cancelled => ErrorCode::ShutdownInProgress,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        match self {
            MessagingError::Connection { .. } => true,
            MessagingError::Protocol { code, .. } => code.is_retryable(),
            MessagingError::Serialization(_)
            | MessagingError::Fatal { .. }
            | MessagingError::Cancelled => false,
        }
    }

    /// 判断是否为致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, MessagingError::Fatal { .. })
    }

    /// 判断是否因关闭而取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MessagingError::Cancelled)
    }

    /// 升级为致命错误（取消信号保持不变）
    pub fn into_fatal(self) -> Self {
        match self {
            MessagingError::Connection { code, reason } | MessagingError::Protocol { code, reason } => {
                MessagingError::Fatal { code, reason }
            }
            MessagingError::Serialization(reason) => {
                MessagingError::Fatal {
                    code: ErrorCode::SerializationError,
                    reason,
                }
            }
            other => other,
        }
    }
}

/// 生产者发送失败
#[derive(Error, Debug, Clone)]
pub enum ProduceError {
    #[error("no topic given and no default topic configured")]
    MissingTopic,

    #[error("failed to serialize message for topic '{topic}': {reason}")]
    Serialization { topic: String, reason: String },

    #[error("failed to produce message to topic '{topic}': {source}")]
    Delivery {
        topic: String,
        #[source]
        source: MessagingError,
    },
}

impl ProduceError {
    /// 调用方是否可以稍后重试（连接层已经按策略重试过）
    pub fn is_retryable(&self) -> bool {
        match self {
            ProduceError::Delivery { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// 底层消息层错误（如有）
    pub fn messaging_error(&self) -> Option<&MessagingError> {
        match self {
            ProduceError::Delivery { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_retry_only_for_transient_codes() {
        assert!(MessagingError::protocol(ErrorCode::LeaderNotAvailable, "election").is_retryable());
        assert!(!MessagingError::protocol(ErrorCode::MessageTooLarge, "2MB").is_retryable());
        assert!(MessagingError::connection("refused").is_retryable());
        assert!(!MessagingError::serialization("bad json").is_retryable());
        assert!(!MessagingError::Cancelled.is_retryable());
    }

    #[test]
    fn into_fatal_keeps_code() {
        let err = MessagingError::protocol(ErrorCode::InvalidRecord, "crc").into_fatal();
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::InvalidRecord);

        assert!(MessagingError::Cancelled.into_fatal().is_cancelled());
    }

    #[test]
    fn retry_exhausted_mentions_last_error() {
        let last = MessagingError::connection("broker down");
        let err = MessagingError::retry_exhausted("connect", 4, &last);
        assert_eq!(err.code(), ErrorCode::RetryBudgetExhausted);
        assert!(err.to_string().contains("after 4 attempts"));
        assert!(err.to_string().contains("broker down"));
    }

    #[test]
    fn produce_error_exposes_source() {
        let err = ProduceError::Delivery {
            topic: "order-created".to_string(),
            source: MessagingError::connection("gone"),
        };
        assert!(err.is_retryable());
        assert!(err.messaging_error().is_some());
        assert!(!ProduceError::MissingTopic.is_retryable());
    }
}
