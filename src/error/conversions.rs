//! 错误类型转换实现
//!
//! 提供各种错误类型之间的转换

use super::{ErrorCode, MessagingError};

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::serialization(format!("JSON error: {err}"))
    }
}

impl From<tokio::task::JoinError> for MessagingError {
    fn from(err: tokio::task::JoinError) -> Self {
        MessagingError::fatal(ErrorCode::InternalError, format!("background task failed: {err}"))
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for MessagingError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError;

        let reason = err.to_string();
        if let Some(code) = err.rdkafka_error_code() {
            return classify_rdkafka_code(code, reason);
        }

        match err {
            KafkaError::ClientConfig(..) | KafkaError::ClientCreation(_) => {
                MessagingError::configuration(reason)
            }
            KafkaError::Canceled => MessagingError::Cancelled,
            _ => MessagingError::connection(reason),
        }
    }
}

/// 将 librdkafka 错误码映射到消息层错误
#[cfg(feature = "kafka")]
fn classify_rdkafka_code(code: rdkafka::error::RDKafkaErrorCode, reason: String) -> MessagingError {
    use rdkafka::error::RDKafkaErrorCode as Rd;

    match code {
        Rd::BrokerTransportFailure | Rd::Resolve | Rd::BrokerNotAvailable | Rd::NetworkException => {
            MessagingError::connection_with(ErrorCode::BrokerUnavailable, reason)
        }
        Rd::AllBrokersDown => MessagingError::connection_with(ErrorCode::AllBrokersDown, reason),
        Rd::MessageTimedOut => MessagingError::protocol(ErrorCode::DeliveryTimedOut, reason),
        Rd::OperationTimedOut => MessagingError::connection_with(ErrorCode::ConnectionTimeout, reason),
        Rd::RequestTimedOut => MessagingError::protocol(ErrorCode::RequestTimedOut, reason),
        Rd::LeaderNotAvailable => MessagingError::protocol(ErrorCode::LeaderNotAvailable, reason),
        Rd::NotLeaderForPartition => {
            MessagingError::protocol(ErrorCode::NotLeaderForPartition, reason)
        }
        Rd::NotEnoughReplicas | Rd::NotEnoughReplicasAfterAppend => {
            MessagingError::protocol(ErrorCode::NotEnoughReplicas, reason)
        }
        Rd::CoordinatorNotAvailable | Rd::NotCoordinator | Rd::CoordinatorLoadInProgress => {
            MessagingError::protocol(ErrorCode::CoordinatorNotAvailable, reason)
        }
        Rd::RebalanceInProgress => MessagingError::protocol(ErrorCode::RebalanceInProgress, reason),
        Rd::QueueFull => MessagingError::protocol(ErrorCode::QueueFull, reason),
        Rd::UnknownTopicOrPartition | Rd::UnknownTopic | Rd::UnknownPartition => {
            MessagingError::protocol(ErrorCode::UnknownTopicOrPartition, reason)
        }
        Rd::MessageSizeTooLarge => MessagingError::protocol(ErrorCode::MessageTooLarge, reason),
        Rd::InvalidMessage => MessagingError::protocol(ErrorCode::InvalidRecord, reason),
        Rd::OffsetOutOfRange => MessagingError::protocol(ErrorCode::OffsetOutOfRange, reason),
        Rd::Authentication | Rd::SaslAuthenticationFailed => {
            MessagingError::authentication_failed(reason)
        }
        Rd::TopicAuthorizationFailed
        | Rd::GroupAuthorizationFailed
        | Rd::ClusterAuthorizationFailed => {
            MessagingError::fatal(ErrorCode::AuthorizationFailed, reason)
        }
        _ => MessagingError::protocol(ErrorCode::ProtocolError, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_become_serialization_errors() {
        let err: MessagingError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, MessagingError::Serialization(_)));
        assert!(!err.is_retryable());
    }

    #[cfg(feature = "kafka")]
    #[test]
    fn transient_broker_codes_stay_retryable() {
        use rdkafka::error::{KafkaError, RDKafkaErrorCode};

        let err: MessagingError =
            KafkaError::MessageProduction(RDKafkaErrorCode::LeaderNotAvailable).into();
        assert!(err.is_retryable());

        let err: MessagingError =
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge).into();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), ErrorCode::MessageTooLarge);

        let err: MessagingError =
            KafkaError::MessageProduction(RDKafkaErrorCode::TopicAuthorizationFailed).into();
        assert!(err.is_fatal());
    }
}
