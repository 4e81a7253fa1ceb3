//! 健康检查模块
//!
//! 生产者、消费者按组件名上报连接状态

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Serving,
    NotServing,
}

/// 健康检查服务
#[derive(Debug, Clone)]
pub struct HealthService {
    statuses: Arc<RwLock<HashMap<String, HealthStatus>>>,
}

impl HealthService {
    pub fn new() -> Self {
        Self {
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn set_status(&self, component: impl Into<String>, status: HealthStatus) {
        let mut statuses = self.statuses.write().await;
        statuses.insert(component.into(), status);
    }

    pub async fn get_status(&self, component: &str) -> HealthStatus {
        let statuses = self.statuses.read().await;
        statuses
            .get(component)
            .copied()
            .unwrap_or(HealthStatus::Unknown)
    }

    /// 所有已上报组件均为 Serving（且至少有一个组件）
    pub async fn is_healthy(&self) -> bool {
        let statuses = self.statuses.read().await;
        !statuses.is_empty() && statuses.values().all(|s| *s == HealthStatus::Serving)
    }

    pub async fn snapshot(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().await.clone()
    }

    pub async fn set_not_serving(&self) {
        let mut statuses = self.statuses.write().await;
        for status in statuses.values_mut() {
            *status = HealthStatus::NotServing;
        }
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}
