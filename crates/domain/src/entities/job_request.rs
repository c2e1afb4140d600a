use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scheduler_core::{SchedulerError, SchedulerResult};

use super::job_definition::JobDefinition;

/// 作业请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Ready,
    Started,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Paused,
    ManualApprovalRequired,
}

impl JobState {
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// 进程崩溃后可能滞留的中间状态
    pub fn can_requeue_orphan(&self) -> bool {
        matches!(
            self,
            JobState::Ready | JobState::Started | JobState::Executing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Ready => "READY",
            JobState::Started => "STARTED",
            JobState::Executing => "EXECUTING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Paused => "PAUSED",
            JobState::ManualApprovalRequired => "MANUAL_APPROVAL_REQUIRED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "READY" => Ok(JobState::Ready),
            "STARTED" => Ok(JobState::Started),
            "EXECUTING" => Ok(JobState::Executing),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            "PAUSED" => Ok(JobState::Paused),
            "MANUAL_APPROVAL_REQUIRED" => Ok(JobState::ManualApprovalRequired),
            other => Err(SchedulerError::Validation(format!("未知的作业状态: {other}"))),
        }
    }
}

/// 作业类型在统计中的身份: `<组织或用户>-<作业类型>[:<版本>]`
pub fn user_job_type_key(
    organization_id: Option<&str>,
    user_id: &str,
    job_type: &str,
    job_version: &str,
) -> String {
    let owner = match organization_id {
        Some(org) if !org.is_empty() => org,
        _ => user_id,
    };
    if job_version.is_empty() {
        format!("{owner}-{job_type}")
    } else {
        format!("{owner}-{job_type}:{job_version}")
    }
}

/// 调度器看到的作业请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequestInfo {
    pub id: u64,
    pub job_definition_id: String,
    pub job_type: String,
    pub job_version: String,
    pub organization_id: Option<String>,
    pub user_id: String,
    /// cron触发请求的去重键
    pub user_key: Option<String>,
    /// 越大越先调度
    pub job_priority: i32,
    pub job_state: JobState,
    pub schedule_attempts: u32,
    pub retried: u32,
    pub cron_triggered: bool,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_job_execution_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub params: HashMap<String, String>,
}

impl JobRequestInfo {
    /// 新的PENDING请求，id由仓储在保存时分配
    pub fn new(job_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_definition_id: String::new(),
            job_type: job_type.into(),
            job_version: String::new(),
            organization_id: None,
            user_id: user_id.into(),
            user_key: None,
            job_priority: 5,
            job_state: JobState::Pending,
            schedule_attempts: 0,
            retried: 0,
            cron_triggered: false,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
            last_job_execution_id: None,
            error_code: None,
            error_message: None,
            params: HashMap::new(),
        }
    }

    /// 根据作业定义生成请求；定义带cron触发器时调度时间为下一次触发时间
    pub fn from_definition(definition: &JobDefinition, now: DateTime<Utc>) -> SchedulerResult<Self> {
        if definition.paused {
            return Err(SchedulerError::Validation(format!(
                "作业 {} 已暂停",
                definition.job_type
            )));
        }

        let mut request = Self::new(definition.job_type.clone(), definition.user_id.clone());
        request.job_definition_id = definition.id.clone();
        request.job_version = definition.sem_version.clone();
        request.organization_id = definition.organization_id.clone();
        request.job_priority = definition.priority;
        request.scheduled_at = now;
        request.created_at = now;
        request.updated_at = now;

        if let Some((scheduled_at, user_key)) = definition.cron_schedule_time_and_user_key(now)? {
            request.scheduled_at = scheduled_at;
            request.user_key = Some(user_key);
            request.cron_triggered = true;
        }
        Ok(request)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.job_priority = priority;
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_definition(mut self, definition: &JobDefinition) -> Self {
        self.job_definition_id = definition.id.clone();
        self.job_version = definition.sem_version.clone();
        self
    }

    pub fn user_job_type_key(&self) -> String {
        user_job_type_key(
            self.organization_id.as_deref(),
            &self.user_id,
            &self.job_type,
            &self.job_version,
        )
    }
}

impl fmt::Display for JobRequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobRequest[id={} type={} state={} priority={} attempts={}]",
            self.id, self.job_type, self.job_state, self.job_priority, self.schedule_attempts
        )
    }
}

/// 带cron触发器的作业类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTypeCronTrigger {
    pub user_id: String,
    pub organization_id: Option<String>,
    pub job_type: String,
    pub cron_trigger: String,
}
