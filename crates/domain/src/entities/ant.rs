use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

/// Ant在心跳中上报的已分配任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntAllocation {
    pub job_request_id: u64,
    pub task_type: String,
    pub allocated_at: DateTime<Utc>,
}

/// Ant注册信息，每次心跳都会整体刷新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntRegistration {
    pub ant_id: String,
    /// Ant接收任务的主题
    pub ant_topic: String,
    pub methods: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub max_capacity: i32,
    #[serde(default)]
    pub current_load: i32,
    #[serde(default)]
    pub allocations: Vec<AntAllocation>,
    #[serde(default = "Utc::now")]
    pub ant_started_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl AntRegistration {
    pub fn new(ant_id: impl Into<String>, methods: &[&str], max_capacity: i32) -> Self {
        let ant_id = ant_id.into();
        let now = Utc::now();
        Self {
            ant_topic: format!("ant-{ant_id}"),
            ant_id,
            methods: methods.iter().map(|m| m.to_string()).collect(),
            tags: Vec::new(),
            max_capacity,
            current_load: 0,
            allocations: Vec::new(),
            ant_started_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// 校验并修正注册信息，容量非正时按1处理
    pub fn validate(&mut self) -> SchedulerResult<()> {
        if self.ant_id.is_empty() {
            return Err(SchedulerError::Validation("ant_id不能为空".to_string()));
        }
        if self.ant_topic.is_empty() {
            return Err(SchedulerError::Validation(format!(
                "Ant {} 缺少主题",
                self.ant_id
            )));
        }
        if self.methods.is_empty() {
            return Err(SchedulerError::Validation(format!(
                "Ant {} 没有声明执行方式",
                self.ant_id
            )));
        }
        if self.max_capacity <= 0 {
            self.max_capacity = 1;
        }
        Ok(())
    }

    pub fn is_alive(&self, alive_timeout: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(alive_timeout) {
            Ok(timeout) => self.updated_at + timeout > now,
            Err(_) => true,
        }
    }

    /// 是否支持该执行方式并具备全部标签，且心跳未过期
    pub fn supports(
        &self,
        method: &str,
        tags: &[String],
        alive_timeout: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        self.methods.iter().any(|m| m == method)
            && tags.iter().all(|tag| self.tags.contains(tag))
            && self.is_alive(alive_timeout, now)
    }
}

/// 为某个请求的某个任务预留的Ant容量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntReservation {
    pub job_request_id: u64,
    pub task_type: String,
    pub ant_id: String,
    pub ant_topic: String,
    pub method: String,
    /// 预留前Ant的负载
    pub current_load: i32,
    pub allocated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_clamps_capacity() {
        let mut registration = AntRegistration::new("ant-1", &["SHELL"], 0);
        registration.validate().unwrap();
        assert_eq!(registration.max_capacity, 1);

        let mut registration = AntRegistration::new("ant-2", &[], 4);
        assert!(registration.validate().is_err());
    }

    #[test]
    fn test_supports_requires_all_tags_and_fresh_heartbeat() {
        let registration = AntRegistration::new("ant-1", &["SHELL", "DOCKER"], 2)
            .with_tags(&["linux", "gpu"]);
        let now = Utc::now();
        let timeout = Duration::from_secs(15);

        assert!(registration.supports("SHELL", &["gpu".to_string()], timeout, now));
        assert!(!registration.supports("KUBERNETES", &[], timeout, now));
        assert!(!registration.supports("SHELL", &["arm".to_string()], timeout, now));

        let later = now + chrono::Duration::seconds(16);
        assert!(!registration.supports("SHELL", &[], timeout, later));
    }
}
