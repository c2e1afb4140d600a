//! 领域事件
//!
//! 调度器在消息总线上收发的事件

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scheduler_core::{MessageHeaders, SchedulerResult};

use crate::entities::{AntReservation, JobExecution, JobState};

/// 领域事件基础trait
pub trait DomainEvent: Serialize + Send + Sync {
    fn event_type(&self) -> &'static str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn aggregate_id(&self) -> String;

    /// 发布时附带的消息头
    fn headers(&self) -> MessageHeaders {
        let mut headers = HashMap::new();
        headers.insert("event_id".to_string(), Uuid::new_v4().to_string());
        headers.insert("event_type".to_string(), self.event_type().to_string());
        headers.insert("aggregate_id".to_string(), self.aggregate_id());
        headers
    }

    fn to_payload(&self) -> SchedulerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// 作业下发事件，Ant侧的启动器据此开始执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionLaunchEvent {
    pub job_execution_id: String,
    pub job_request_id: u64,
    pub job_type: String,
    pub job_version: String,
    pub user_id: String,
    pub organization_id: Option<String>,
    pub job_priority: i32,
    pub reservations: Vec<AntReservation>,
    pub created_at: DateTime<Utc>,
}

impl JobExecutionLaunchEvent {
    pub fn new(execution: &JobExecution) -> Self {
        Self {
            job_execution_id: execution.id.clone(),
            job_request_id: execution.job_request_id,
            job_type: execution.job_type.clone(),
            job_version: execution.job_version.clone(),
            user_id: execution.user_id.clone(),
            organization_id: execution.organization_id.clone(),
            job_priority: execution.job_priority,
            reservations: execution.reservations.clone(),
            created_at: Utc::now(),
        }
    }
}

impl DomainEvent for JobExecutionLaunchEvent {
    fn event_type(&self) -> &'static str {
        "JobExecutionLaunchEvent"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn aggregate_id(&self) -> String {
        self.job_request_id.to_string()
    }
}

/// 作业执行生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionLifecycleEvent {
    pub job_request_id: u64,
    pub job_execution_id: String,
    pub job_type: String,
    #[serde(default)]
    pub job_version: String,
    pub user_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    pub job_state: JobState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for JobExecutionLifecycleEvent {
    fn event_type(&self) -> &'static str {
        "JobExecutionLifecycleEvent"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn aggregate_id(&self) -> String {
        self.job_request_id.to_string()
    }
}

/// 任务执行生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionLifecycleEvent {
    pub job_request_id: u64,
    pub job_execution_id: String,
    pub task_type: String,
    pub ant_id: String,
    pub task_state: JobState,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for TaskExecutionLifecycleEvent {
    fn event_type(&self) -> &'static str {
        "TaskExecutionLifecycleEvent"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn aggregate_id(&self) -> String {
        format!("{}-{}", self.job_request_id, self.task_type)
    }
}

/// 领导者心跳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedulerLeaderEvent {
    pub server_id: String,
    pub lease_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for JobSchedulerLeaderEvent {
    fn event_type(&self) -> &'static str {
        "JobSchedulerLeaderEvent"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn aggregate_id(&self) -> String {
        self.server_id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerAction {
    Terminate,
}

/// 发送给Ant的容器控制命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerControlCommand {
    pub action: ContainerAction,
    pub ant_id: String,
    pub method: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
}

impl DomainEvent for ContainerControlCommand {
    fn event_type(&self) -> &'static str {
        "ContainerControlCommand"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn aggregate_id(&self) -> String {
        self.container_id.clone()
    }
}
