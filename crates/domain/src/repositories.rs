//! 领域仓储抽象
//!
//! 调度核心只把存储当作有序的批量来源和变更出口

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scheduler_core::SchedulerResult;

use crate::entities::{
    JobDefinition, JobExecution, JobRequestInfo, JobState, JobTypeCronTrigger, Organization,
    ResourceUsage, User,
};

/// 作业请求仓储
#[async_trait]
pub trait JobRequestRepository: Send + Sync {
    async fn get(&self, id: u64) -> SchedulerResult<JobRequestInfo>;

    /// 新请求(id为0)分配id后插入，否则覆盖
    async fn save(&self, request: &JobRequestInfo) -> SchedulerResult<JobRequestInfo>;

    async fn delete(&self, id: u64) -> SchedulerResult<()>;

    /// PENDING 且 scheduled_at 已到的请求，按优先级降序、id升序
    async fn next_schedulable_job_requests_by_type(
        &self,
        job_types: &[String],
        limit: usize,
    ) -> SchedulerResult<Vec<JobRequestInfo>>;

    /// 记录一次失败的调度尝试；请求已不是PENDING时不修改并返回false
    async fn increment_schedule_attempts(
        &self,
        id: u64,
        scheduled_at: DateTime<Utc>,
        decrement_priority: i32,
        error_message: &str,
    ) -> SchedulerResult<bool>;

    /// 把超时未更新的中间状态请求改回PENDING，返回被改回的id
    async fn requeue_orphan_job_requests(&self, stale: Duration) -> SchedulerResult<Vec<u64>>;

    /// 返回尚没有未来待执行请求的cron作业类型
    async fn find_missing_cron_scheduled_jobs_by_type(
        &self,
        triggers: &[JobTypeCronTrigger],
    ) -> SchedulerResult<Vec<JobTypeCronTrigger>>;

    /// 仅当当前状态属于 `expected` 时更新状态，返回是否更新
    async fn update_job_state(
        &self,
        id: u64,
        expected: &[JobState],
        new_state: JobState,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> SchedulerResult<bool>;

    /// PENDING -> READY，并记录执行id；请求不是PENDING时返回 `StateConflict`
    async fn set_ready_to_execute(&self, id: u64, job_execution_id: &str) -> SchedulerResult<()>;

    /// READY -> PENDING，返回是否更新
    async fn revert_to_pending(&self, id: u64) -> SchedulerResult<bool>;
}

/// 作业定义仓储
#[async_trait]
pub trait JobDefinitionRepository: Send + Sync {
    async fn get(&self, id: &str) -> SchedulerResult<JobDefinition>;

    async fn get_by_type(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        job_type: &str,
    ) -> SchedulerResult<JobDefinition>;

    async fn get_cron_triggered_job_types(&self) -> SchedulerResult<Vec<JobTypeCronTrigger>>;
}

/// 作业执行记录仓储
#[async_trait]
pub trait JobExecutionRepository: Send + Sync {
    /// 同一请求已有未结束的执行记录时返回 `StateConflict`
    async fn create(&self, execution: &JobExecution) -> SchedulerResult<JobExecution>;

    async fn get(&self, id: &str) -> SchedulerResult<JobExecution>;

    async fn find_by_request(&self, job_request_id: u64) -> SchedulerResult<Vec<JobExecution>>;

    async fn update_state(&self, id: &str, state: JobState) -> SchedulerResult<()>;

    async fn delete(&self, id: &str) -> SchedulerResult<()>;
}

/// 用户、组织与用量
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get_user(&self, id: &str) -> SchedulerResult<User>;

    async fn get_organization(&self, id: &str) -> SchedulerResult<Organization>;

    /// 组织存在时统计组织用量，否则统计用户用量
    async fn usage(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> SchedulerResult<ResourceUsage>;
}
