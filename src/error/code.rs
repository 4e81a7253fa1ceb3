//! 错误代码和错误类别定义
//!
//! broker 返回的错误与客户端本地错误统一映射到这里的代码，
//! 重试策略只依据代码判断是否为暂态故障

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接相关错误
/// - 2000-2999: 认证相关错误
/// - 3000-3999: broker 协议相关错误
/// - 4000-4999: 序列化相关错误
/// - 5000-5999: 客户端/配置相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接相关错误 (1000-1999)
    // ============================================================
    BrokerUnavailable = 1000,
    ConnectionTimeout = 1001,
    ConnectionClosed = 1002,
    NotConnected = 1003,
    AllBrokersDown = 1004,

    // ============================================================
    // 认证相关错误 (2000-2999)
    // ============================================================
    AuthenticationFailed = 2000,
    AuthorizationFailed = 2001,

    // ============================================================
    // broker 协议相关错误 (3000-3999)
    // ============================================================
    LeaderNotAvailable = 3000,
    NotLeaderForPartition = 3001,
    RequestTimedOut = 3002,
    NotEnoughReplicas = 3003,
    CoordinatorNotAvailable = 3004,
    RebalanceInProgress = 3005,
    QueueFull = 3006,
    UnknownTopicOrPartition = 3007,
    MessageTooLarge = 3008,
    InvalidRecord = 3009,
    OffsetOutOfRange = 3010,
    /// 投递确认超时，broker 可能已经写入
    DeliveryTimedOut = 3011,
    ProtocolError = 3099,

    // ============================================================
    // 序列化相关错误 (4000-4999)
    // ============================================================
    SerializationError = 4000,
    DeserializationError = 4001,

    // ============================================================
    // 客户端/配置相关错误 (5000-5999)
    // ============================================================
    ConfigurationError = 5000,
    RetryBudgetExhausted = 5001,
    TopicNotFound = 5002,
    ShutdownInProgress = 5003,
    InternalError = 5004,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    UnknownError = 9999,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BrokerUnavailable => "BROKER_UNAVAILABLE",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::AllBrokersDown => "ALL_BROKERS_DOWN",
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::AuthorizationFailed => "AUTHORIZATION_FAILED",
            ErrorCode::LeaderNotAvailable => "LEADER_NOT_AVAILABLE",
            ErrorCode::NotLeaderForPartition => "NOT_LEADER_FOR_PARTITION",
            ErrorCode::RequestTimedOut => "REQUEST_TIMED_OUT",
            ErrorCode::NotEnoughReplicas => "NOT_ENOUGH_REPLICAS",
            ErrorCode::CoordinatorNotAvailable => "COORDINATOR_NOT_AVAILABLE",
            ErrorCode::RebalanceInProgress => "REBALANCE_IN_PROGRESS",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::UnknownTopicOrPartition => "UNKNOWN_TOPIC_OR_PARTITION",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::InvalidRecord => "INVALID_RECORD",
            ErrorCode::OffsetOutOfRange => "OFFSET_OUT_OF_RANGE",
            ErrorCode::DeliveryTimedOut => "DELIVERY_TIMED_OUT",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::RetryBudgetExhausted => "RETRY_BUDGET_EXHAUSTED",
            ErrorCode::TopicNotFound => "TOPIC_NOT_FOUND",
            ErrorCode::ShutdownInProgress => "SHUTDOWN_IN_PROGRESS",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// 获取错误代码的类别（用于错误分类）
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Authentication,
            3000..=3999 => ErrorCategory::Protocol,
            4000..=4999 => ErrorCategory::Serialization,
            5000..=5999 => ErrorCategory::Client,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 连接类错误全部视为暂态；协议类错误只有 broker 明确标记为暂态的代码可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::BrokerUnavailable
                | ErrorCode::ConnectionTimeout
                | ErrorCode::ConnectionClosed
                | ErrorCode::NotConnected
                | ErrorCode::AllBrokersDown
                | ErrorCode::LeaderNotAvailable
                | ErrorCode::NotLeaderForPartition
                | ErrorCode::RequestTimedOut
                | ErrorCode::NotEnoughReplicas
                | ErrorCode::CoordinatorNotAvailable
                | ErrorCode::RebalanceInProgress
                | ErrorCode::QueueFull
                | ErrorCode::DeliveryTimedOut
        )
    }

    /// 请求可能已被 broker 执行但未收到确认
    pub fn is_ambiguous_delivery(&self) -> bool {
        matches!(self, ErrorCode::DeliveryTimedOut | ErrorCode::RequestTimedOut)
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Authentication,
    Protocol,
    Serialization,
    Client,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Authentication => write!(f, "AUTHENTICATION"),
            ErrorCategory::Protocol => write!(f, "PROTOCOL"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::Client => write!(f, "CLIENT"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_code_ranges() {
        assert_eq!(ErrorCode::AllBrokersDown.category(), ErrorCategory::Connection);
        assert_eq!(ErrorCode::AuthorizationFailed.category(), ErrorCategory::Authentication);
        assert_eq!(ErrorCode::QueueFull.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorCode::DeserializationError.category(), ErrorCategory::Serialization);
        assert_eq!(ErrorCode::TopicNotFound.category(), ErrorCategory::Client);
        assert_eq!(ErrorCode::UnknownError.category(), ErrorCategory::General);
    }

    #[test]
    fn only_transient_broker_codes_are_retryable() {
        assert!(ErrorCode::BrokerUnavailable.is_retryable());
        assert!(ErrorCode::LeaderNotAvailable.is_retryable());
        assert!(ErrorCode::RebalanceInProgress.is_retryable());

        assert!(!ErrorCode::MessageTooLarge.is_retryable());
        assert!(!ErrorCode::AuthenticationFailed.is_retryable());
        assert!(!ErrorCode::SerializationError.is_retryable());
        assert!(!ErrorCode::RetryBudgetExhausted.is_retryable());
    }

    #[test]
    fn display_uses_identifier() {
        assert_eq!(ErrorCode::NotEnoughReplicas.to_string(), "NOT_ENOUGH_REPLICAS");
        assert_eq!(ErrorCode::ProtocolError.as_u32(), 3099);
    }

    #[test]
    fn timeouts_after_send_are_ambiguous() {
        assert!(ErrorCode::DeliveryTimedOut.is_ambiguous_delivery());
        assert!(ErrorCode::RequestTimedOut.is_ambiguous_delivery());
        assert!(!ErrorCode::ConnectionClosed.is_ambiguous_delivery());
        assert!(!ErrorCode::ConnectionTimeout.is_ambiguous_delivery());
    }
}
