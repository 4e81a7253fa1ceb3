//! 运行时配置模块

use std::time::Duration;

use envconfig::Envconfig;

use crate::config::EnvMsDuration;

/// 运行时配置
#[derive(Envconfig, Debug, Clone)]
pub struct RuntimeConfig {
    /// 每个句柄的关闭超时时间（默认 5 秒），包括等待进行中的 handler
    #[envconfig(from = "SHUTDOWN_TIMEOUT", default = "5000")]
    pub shutdown_timeout: EnvMsDuration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: EnvMsDuration(Duration::from_secs(5)),
        }
    }
}

impl RuntimeConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置关闭超时时间
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = EnvMsDuration(timeout);
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout.0
    }
}
