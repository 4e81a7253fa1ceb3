//! 消息层配置
//!
//! 从环境变量（envconfig）或 TOML 文件加载，`validate()` 检查取值范围

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consumer::ConsumerSettings;
use crate::error::MessagingError;
use crate::producer::ProducerSettings;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

// ============================================================================
// 值类型
// ============================================================================

/// 以毫秒表示的时长
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

impl From<u64> for EnvMsDuration {
    fn from(ms: u64) -> Self {
        EnvMsDuration(Duration::from_millis(ms))
    }
}

impl From<EnvMsDuration> for u64 {
    fn from(value: EnvMsDuration) -> Self {
        value.0.as_millis() as u64
    }
}

/// 生产者确认级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// 不等待确认
    None,
    /// 仅等待 leader 确认
    Leader,
    /// 等待全部同步副本确认
    All,
}

impl Acks {
    /// librdkafka `acks` 取值
    pub fn as_kafka_value(&self) -> &'static str {
        match self {
            Acks::None => "0",
            Acks::Leader => "1",
            Acks::All => "all",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseAcksError(String);

impl fmt::Display for ParseAcksError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid acks value '{}', expected none|leader|all|0|1|-1", self.0)
    }
}

impl FromStr for Acks {
    type Err = ParseAcksError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Acks::None),
            "leader" | "1" => Ok(Acks::Leader),
            "all" | "-1" => Ok(Acks::All),
            other => Err(ParseAcksError(other.to_string())),
        }
    }
}

// ============================================================================
// 配置
// ============================================================================

/// 配置错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for MessagingError {
    fn from(err: ConfigError) -> Self {
        MessagingError::configuration(err.to_string())
    }
}

/// 消息层配置
#[derive(Envconfig, Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// 逗号分隔的 broker 地址
    #[envconfig(from = "KAFKA_BROKERS", default = "kafka:9092")]
    pub brokers: String,

    #[envconfig(from = "KAFKA_CLIENT_ID", default = "flare-mq-client")]
    pub client_id: String,

    #[envconfig(from = "KAFKA_GROUP_ID", default = "flare-consumer-group")]
    pub group_id: String,

    /// 生产者未指定 topic 时使用
    #[envconfig(from = "KAFKA_DEFAULT_TOPIC")]
    pub default_topic: Option<String>,

    #[envconfig(from = "KAFKA_CONSUMER_SESSION_TIMEOUT", default = "30000")]
    pub session_timeout: EnvMsDuration,

    #[envconfig(from = "KAFKA_CONSUMER_HEARTBEAT_INTERVAL", default = "3000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(from = "KAFKA_RETRY_INITIAL_DELAY", default = "100")]
    pub retry_initial_delay: EnvMsDuration,

    #[envconfig(from = "KAFKA_RETRY_MAX_DELAY", default = "30000")]
    pub retry_max_delay: EnvMsDuration,

    #[envconfig(from = "KAFKA_RETRY_MULTIPLIER", default = "2")]
    pub retry_multiplier: f64,

    #[envconfig(from = "KAFKA_MAX_RETRIES", default = "10")]
    pub max_retries: u32,

    #[envconfig(from = "KAFKA_TOPIC_PROBE_ATTEMPTS", default = "10")]
    pub topic_probe_attempts: u32,

    #[envconfig(from = "KAFKA_TOPIC_PROBE_DELAY", default = "2000")]
    pub topic_probe_delay: EnvMsDuration,

    #[envconfig(from = "KAFKA_COMMIT_INTERVAL", default = "5000")]
    pub commit_interval: EnvMsDuration,

    #[envconfig(from = "KAFKA_COMMIT_THRESHOLD", default = "100")]
    pub commit_threshold: u64,

    #[envconfig(from = "KAFKA_PARTITION_CONCURRENCY", default = "4")]
    pub partition_concurrency: usize,

    #[envconfig(from = "KAFKA_PARTITION_BUFFER", default = "64")]
    pub partition_buffer: usize,

    #[envconfig(from = "KAFKA_CRASH_BACKOFF_INITIAL", default = "1000")]
    pub crash_backoff_initial: EnvMsDuration,

    #[envconfig(from = "KAFKA_CRASH_BACKOFF_MAX", default = "30000")]
    pub crash_backoff_max: EnvMsDuration,

    #[envconfig(from = "KAFKA_IDEMPOTENT_PRODUCER", default = "true")]
    pub idempotent_producer: bool,

    #[envconfig(from = "KAFKA_ACKS", default = "all")]
    pub acks: Acks,

    #[envconfig(from = "KAFKA_FROM_BEGINNING", default = "true")]
    pub from_beginning: bool,

    #[envconfig(from = "KAFKA_MESSAGE_TIMEOUT", default = "30000")]
    pub message_timeout: EnvMsDuration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            brokers: "kafka:9092".to_string(),
            client_id: "flare-mq-client".to_string(),
            group_id: "flare-consumer-group".to_string(),
            default_topic: None,
            session_timeout: EnvMsDuration(Duration::from_millis(30000)),
            heartbeat_interval: EnvMsDuration(Duration::from_millis(3000)),
            retry_initial_delay: EnvMsDuration(Duration::from_millis(100)),
            retry_max_delay: EnvMsDuration(Duration::from_millis(30000)),
            retry_multiplier: 2.0,
            max_retries: 10,
            topic_probe_attempts: 10,
            topic_probe_delay: EnvMsDuration(Duration::from_millis(2000)),
            commit_interval: EnvMsDuration(Duration::from_millis(5000)),
            commit_threshold: 100,
            partition_concurrency: 4,
            partition_buffer: 64,
            crash_backoff_initial: EnvMsDuration(Duration::from_millis(1000)),
            crash_backoff_max: EnvMsDuration(Duration::from_millis(30000)),
            idempotent_producer: true,
            acks: Acks::All,
            from_beginning: true,
            message_timeout: EnvMsDuration(Duration::from_millis(30000)),
        }
    }
}

impl MessagingConfig {
    /// 从环境变量加载并校验
    pub fn from_env() -> Result<Self, MessagingError> {
        let config = Self::init_from_env()
            .map_err(|err| MessagingError::configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载并校验，缺省字段取默认值
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        let config: MessagingConfig = toml::from_str(&content).map_err(|err| ConfigError::Parse {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_list().is_empty() {
            return Err(ConfigError::invalid("brokers", "at least one broker address is required"));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::invalid("group_id", "must not be empty"));
        }
        if !(self.retry_multiplier.is_finite() && self.retry_multiplier >= 1.0) {
            return Err(ConfigError::invalid("retry_multiplier", "must be a finite number >= 1"));
        }
        if self.retry_initial_delay.0 > self.retry_max_delay.0 {
            return Err(ConfigError::invalid("retry_initial_delay", "must not exceed retry_max_delay"));
        }
        if self.crash_backoff_initial.0 > self.crash_backoff_max.0 {
            return Err(ConfigError::invalid("crash_backoff_initial", "must not exceed crash_backoff_max"));
        }
        if self.topic_probe_attempts == 0 {
            return Err(ConfigError::invalid("topic_probe_attempts", "must be at least 1"));
        }
        if self.commit_interval.0.is_zero() {
            return Err(ConfigError::invalid("commit_interval", "must be greater than zero"));
        }
        if self.commit_threshold == 0 {
            return Err(ConfigError::invalid("commit_threshold", "must be at least 1"));
        }
        if self.partition_concurrency == 0 {
            return Err(ConfigError::invalid("partition_concurrency", "must be at least 1"));
        }
        if self.heartbeat_interval.0 >= self.session_timeout.0 {
            return Err(ConfigError::invalid("heartbeat_interval", "must be lower than session_timeout"));
        }
        if self.idempotent_producer && self.acks != Acks::All {
            return Err(ConfigError::invalid("acks", "idempotent producer requires acks=all"));
        }
        Ok(())
    }

    pub fn broker_list(&self) -> Vec<&str> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// 连接 / 发送重试策略
    pub fn retry_policy(&self) -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(
            self.retry_initial_delay.0,
            self.retry_max_delay.0,
            self.retry_multiplier,
        )
        .with_max_retries(self.max_retries)
    }

    pub fn shared_retry_policy(&self) -> Arc<dyn RetryPolicy> {
        Arc::new(self.retry_policy())
    }

    pub fn producer_settings(&self) -> ProducerSettings {
        ProducerSettings {
            default_topic: self.default_topic.clone().filter(|t| !t.is_empty()),
            idempotent: self.idempotent_producer,
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            from_beginning: self.from_beginning,
            partition_concurrency: self.partition_concurrency,
            commit_interval: self.commit_interval.0,
            commit_threshold: self.commit_threshold,
            max_probe_attempts: self.topic_probe_attempts,
            probe_delay: self.topic_probe_delay.0,
            partition_buffer: self.partition_buffer,
            crash_backoff: ExponentialBackoffPolicy::new(
                self.crash_backoff_initial.0,
                self.crash_backoff_max.0,
                self.retry_multiplier,
            ),
        }
    }
}
