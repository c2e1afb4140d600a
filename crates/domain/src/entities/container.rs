use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 标签中记录作业请求ID的键
pub const LABEL_JOB_REQUEST_ID: &str = "RequestID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ContainerState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ContainerState::Completed | ContainerState::Failed | ContainerState::Cancelled
        )
    }
}

/// Ant侧执行容器的启动/停止事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerLifecycleEvent {
    pub user_id: String,
    pub ant_id: String,
    pub method: String,
    pub container_name: String,
    pub container_id: String,
    pub container_state: ContainerState,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ContainerLifecycleEvent {
    /// 执行方式+容器名唯一标识一个容器
    pub fn key(&self) -> String {
        format!("{}-{}", self.method, self.container_name)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.ended_at.unwrap_or(now) - self.started_at
    }

    pub fn job_request_id(&self) -> Option<u64> {
        self.labels
            .get(LABEL_JOB_REQUEST_ID)
            .and_then(|id| id.parse().ok())
    }
}
