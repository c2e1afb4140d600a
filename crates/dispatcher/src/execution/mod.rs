//! 单次调度尝试的执行状态机
//!
//! 每个(请求, 调度尝试)构建一个 `JobExecutionStateMachine`，按顺序经过
//! 校验 -> 订阅配额 -> 过滤 -> 资源与并发检查 -> 预留资源 -> 创建执行记录，
//! 任何一步失败都会中止本次尝试。

pub mod filter;
pub mod retry;

pub use retry::{plan_retry, RetryPlan, RetryPolicy};

use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use tracing::{debug, error, info, info_span, warn, Instrument};

use scheduler_core::{
    config::{JobsConfig, MessageQueueConfig},
    MessageQueue, SchedulerError, SchedulerResult,
};
use scheduler_domain::{
    entities::{
        AntReservation, ErrorCategory, JobDefinition, JobExecution, JobRequestInfo, JobState,
        Organization, Subscription, User,
    },
    events::{DomainEvent, JobExecutionLaunchEvent},
};
use scheduler_infrastructure::{Repositories, SchedulerMetrics};

use crate::resource::ResourceManager;
use crate::stats::StatsRegistry;

/// 状态机运行所需的全部协作者
#[derive(Clone)]
pub struct SchedulingContext {
    pub jobs: JobsConfig,
    pub topics: MessageQueueConfig,
    pub repositories: Repositories,
    pub resources: Arc<dyn ResourceManager>,
    pub stats: Arc<StatsRegistry>,
    pub queue: Arc<dyn MessageQueue>,
    pub metrics: SchedulerMetrics,
}

/// 一次调度尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// 已创建执行记录并下发
    Scheduled { job_execution_id: String },
    /// 命中过滤规则；`deleted` 表示请求已被删除
    Filtered { deleted: bool },
    /// 终态失败，请求已置为FAILED
    Failed {
        category: ErrorCategory,
        message: String,
    },
    /// 资源不足，推迟到 `scheduled_at` 再调度
    Retry {
        attempts: u32,
        scheduled_at: DateTime<Utc>,
    },
    /// 下发失败，请求已改回PENDING
    Reverted,
    /// 本次没有做任何改动
    Skipped { reason: String },
}

impl ScheduleOutcome {
    /// 本次尝试是否推进了请求（下发、终结或记录了一次重试）
    pub fn is_progress(&self) -> bool {
        matches!(
            self,
            ScheduleOutcome::Scheduled { .. }
                | ScheduleOutcome::Filtered { .. }
                | ScheduleOutcome::Failed { .. }
                | ScheduleOutcome::Retry { .. }
        )
    }
}

/// 阶段失败的走向
enum StageError {
    /// 终态失败
    Terminal(SchedulerError),
    /// 资源或并发不足，按重试策略推迟
    NotReady(SchedulerError),
    /// 立即结束本次尝试
    Done(ScheduleOutcome),
    /// 基础设施错误，请求保持原样
    Transient(SchedulerError),
}

impl From<SchedulerError> for StageError {
    fn from(err: SchedulerError) -> Self {
        if err.is_terminal() {
            StageError::Terminal(err)
        } else {
            StageError::Transient(err)
        }
    }
}

type StageResult<T> = Result<T, StageError>;

/// 把"找不到"类错误视为请求本身无效
fn missing_is_invalid(err: SchedulerError) -> StageError {
    match err {
        SchedulerError::JobDefinitionNotFound { .. }
        | SchedulerError::UserNotFound { .. }
        | SchedulerError::OrganizationNotFound { .. } => {
            StageError::Terminal(SchedulerError::Validation(err.to_string()))
        }
        other => other.into(),
    }
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// 单个请求的一次调度尝试
pub struct JobExecutionStateMachine {
    ctx: Arc<SchedulingContext>,
    request: JobRequestInfo,
    definition: Option<JobDefinition>,
    user: Option<User>,
    organization: Option<Organization>,
    reservations: Vec<AntReservation>,
    execution: Option<JobExecution>,
}

impl JobExecutionStateMachine {
    pub fn new(ctx: Arc<SchedulingContext>, request: JobRequestInfo) -> Self {
        Self {
            ctx,
            request,
            definition: None,
            user: None,
            organization: None,
            reservations: Vec::new(),
            execution: None,
        }
    }

    pub fn request(&self) -> &JobRequestInfo {
        &self.request
    }

    /// 执行整条流水线
    ///
    /// 只有基础设施错误会以 `Err` 返回，此时请求不做任何修改。
    pub async fn run(mut self) -> SchedulerResult<ScheduleOutcome> {
        let span = info_span!(
            "job_execution",
            request_id = self.request.id,
            job_type = %self.request.job_type,
            attempts = self.request.schedule_attempts
        );
        async move {
            match self.pipeline().await {
                Ok(outcome) => Ok(outcome),
                Err(StageError::Done(outcome)) => Ok(outcome),
                Err(StageError::Terminal(err)) => self.schedule_failed(err).await,
                Err(StageError::NotReady(err)) => self.not_ready(err).await,
                Err(StageError::Transient(err)) => {
                    warn!("调度请求时遇到瞬时错误: {err}");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn pipeline(&mut self) -> StageResult<ScheduleOutcome> {
        self.validate().await?;
        self.check_subscription_quota().await?;
        self.should_filter().await?;
        self.check_ant_resources_and_concurrency()?;
        self.reserve_job_resources()?;
        self.create_job_execution().await
    }

    fn definition(&self) -> StageResult<&JobDefinition> {
        self.definition.as_ref().ok_or_else(|| {
            StageError::Transient(SchedulerError::Internal("作业定义尚未加载".to_string()))
        })
    }

    /// 加载并校验作业定义、用户与组织
    async fn validate(&mut self) -> StageResult<()> {
        let repos = &self.ctx.repositories;
        // 批次里的副本可能已过期，以存储中的状态为准
        match repos.job_requests.get(self.request.id).await {
            Ok(current) => self.request = current,
            Err(SchedulerError::JobRequestNotFound { .. }) => {
                return Err(StageError::Done(ScheduleOutcome::Skipped {
                    reason: "请求已被删除".to_string(),
                }));
            }
            Err(err) => return Err(err.into()),
        }
        if !self.request.job_state.is_pending() {
            return Err(StageError::Done(ScheduleOutcome::Skipped {
                reason: format!("请求状态为 {}", self.request.job_state),
            }));
        }

        let definition = if self.request.job_definition_id.is_empty() {
            repos
                .job_definitions
                .get_by_type(
                    &self.request.user_id,
                    self.request.organization_id.as_deref(),
                    &self.request.job_type,
                )
                .await
        } else {
            repos
                .job_definitions
                .get(&self.request.job_definition_id)
                .await
        }
        .map_err(missing_is_invalid)?;

        if definition.disabled {
            self.ctx.stats.set_disabled(&self.request, true);
            return Err(StageError::Terminal(SchedulerError::Validation(format!(
                "作业 {} 已禁用",
                definition.job_type
            ))));
        }
        if definition.paused {
            return Err(StageError::Terminal(SchedulerError::Validation(format!(
                "作业 {} 已暂停",
                definition.job_type
            ))));
        }
        definition.validate().map_err(StageError::Terminal)?;

        let user = repos
            .accounts
            .get_user(&self.request.user_id)
            .await
            .map_err(missing_is_invalid)?;
        if user.disabled {
            return Err(StageError::Terminal(SchedulerError::Validation(format!(
                "用户 {} 已被禁用",
                user.id
            ))));
        }

        let organization = match self.request.organization_id.as_deref() {
            Some(org) if !org.is_empty() => Some(
                repos
                    .accounts
                    .get_organization(org)
                    .await
                    .map_err(missing_is_invalid)?,
            ),
            _ => None,
        };

        self.definition = Some(definition);
        self.user = Some(user);
        self.organization = organization;
        Ok(())
    }

    fn subscription(&self) -> Option<&Subscription> {
        match &self.organization {
            Some(org) => org.subscription.as_ref(),
            None => self.user.as_ref().and_then(|u| u.subscription.as_ref()),
        }
    }

    async fn check_subscription_quota(&mut self) -> StageResult<()> {
        if !self.ctx.jobs.subscription_quota_enabled {
            return Ok(());
        }
        let Some(subscription) = self.subscription().cloned() else {
            return Ok(());
        };

        let now = Utc::now();
        if subscription.expired(now) {
            return Err(StageError::Terminal(SchedulerError::QuotaExceeded(format!(
                "订阅 {} 已于 {} 过期",
                subscription.plan, subscription.ends_at
            ))));
        }

        let usage = self
            .ctx
            .repositories
            .accounts
            .usage(
                &self.request.user_id,
                self.request.organization_id.as_deref(),
                month_start(now),
            )
            .await?;
        if subscription.cpu_quota_secs > 0 && usage.cpu_secs >= subscription.cpu_quota_secs {
            return Err(StageError::Terminal(SchedulerError::QuotaExceeded(format!(
                "CPU用量 {}秒 已达到配额 {}秒",
                usage.cpu_secs, subscription.cpu_quota_secs
            ))));
        }
        if subscription.disk_quota_mb > 0 && usage.disk_mb >= subscription.disk_quota_mb {
            return Err(StageError::Terminal(SchedulerError::QuotaExceeded(format!(
                "磁盘用量 {}MB 已达到配额 {}MB",
                usage.disk_mb, subscription.disk_quota_mb
            ))));
        }
        Ok(())
    }

    async fn should_filter(&mut self) -> StageResult<()> {
        let definition = self.definition()?;
        let context = filter::filter_context(&self.request, definition, Utc::now());
        let Some(rule) = definition.filtered(&context) else {
            return Ok(());
        };
        let message = format!("命中过滤规则 {} {:?} {:?}", rule.field, rule.op, rule.values);
        let delete = definition.delete_filtered_cron_jobs() && self.request.cron_triggered;

        let repo = &self.ctx.repositories.job_requests;
        if delete {
            repo.delete(self.request.id).await?;
        } else {
            repo.update_job_state(
                self.request.id,
                &[JobState::Pending],
                JobState::Failed,
                Some(ErrorCategory::FilteredJob.error_code()),
                Some(&message),
            )
            .await?;
        }
        self.ctx.stats.remove_pending(&self.request);
        self.ctx.metrics.record_schedule_failed(
            &self.request.job_type,
            ErrorCategory::FilteredJob.error_code(),
        );
        info!(deleted = delete, "请求被过滤: {message}");
        Err(StageError::Done(ScheduleOutcome::Filtered { deleted: delete }))
    }

    fn check_ant_resources_and_concurrency(&mut self) -> StageResult<()> {
        let definition = self.definition()?;
        let stats = &self.ctx.stats;

        let executing = stats.get_execution_count(&self.request.user_job_type_key());
        if definition.max_concurrency > 0 && executing >= i64::from(definition.max_concurrency) {
            return Err(StageError::NotReady(SchedulerError::AntResourcesUnavailable(
                format!(
                    "作业 {} 执行中 {} 个，已达到并发上限 {}",
                    definition.job_type, executing, definition.max_concurrency
                ),
            )));
        }

        let (by_user, by_org) = stats.user_org_executing(&self.request);
        if let Some(user) = &self.user {
            if user.max_concurrency > 0 && by_user >= user.max_concurrency as usize {
                return Err(StageError::NotReady(SchedulerError::AntResourcesUnavailable(
                    format!(
                        "用户 {} 执行中 {} 个，已达到并发上限 {}",
                        user.id, by_user, user.max_concurrency
                    ),
                )));
            }
        }
        if let Some(org) = &self.organization {
            if org.max_concurrency > 0 && by_org >= org.max_concurrency as usize {
                return Err(StageError::NotReady(SchedulerError::AntResourcesUnavailable(
                    format!(
                        "组织 {} 执行中 {} 个，已达到并发上限 {}",
                        org.id, by_org, org.max_concurrency
                    ),
                )));
            }
        }

        self.ctx
            .resources
            .has_ants_for_job_tags(&definition.methods(), &definition.tags)
            .map_err(StageError::NotReady)
    }

    fn reserve_job_resources(&mut self) -> StageResult<()> {
        let definition = self.definition()?;
        match self
            .ctx
            .resources
            .reserve_job_resources(self.request.id, definition)
        {
            Ok(reservations) => {
                self.reservations = reservations;
                Ok(())
            }
            Err(SchedulerError::AlreadyScheduled { id }) => {
                debug!("请求 {id} 已持有预留，跳过");
                Err(StageError::Done(ScheduleOutcome::Skipped {
                    reason: "请求已持有资源预留".to_string(),
                }))
            }
            Err(err @ SchedulerError::AntResourcesUnavailable(_)) => Err(StageError::NotReady(err)),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_job_execution(&mut self) -> StageResult<ScheduleOutcome> {
        let repos = self.ctx.repositories.clone();
        let execution = JobExecution::for_request(&self.request, self.reservations.clone());

        let mut created = repos.job_executions.create(&execution).await;
        if let Err(SchedulerError::StateConflict(_)) = &created {
            // 持有预留时不会有其他尝试在创建执行记录，残留的只能是之前撤销失败的记录
            self.cancel_stale_executions().await;
            created = repos.job_executions.create(&execution).await;
        }
        if let Err(err) = created {
            if let SchedulerError::StateConflict(msg) = &err {
                self.ctx.resources.release_job_resources(self.request.id);
                return Err(StageError::Done(ScheduleOutcome::Skipped {
                    reason: msg.clone(),
                }));
            }
            return Err(StageError::Terminal(SchedulerError::JobExecuteFailure(
                format!("保存执行记录失败: {err}"),
            )));
        }

        if let Err(err) = repos
            .job_requests
            .set_ready_to_execute(self.request.id, &execution.id)
            .await
        {
            self.discard_execution(&execution).await;
            if let SchedulerError::StateConflict(msg) = &err {
                self.ctx.resources.release_job_resources(self.request.id);
                return Err(StageError::Done(ScheduleOutcome::Skipped {
                    reason: msg.clone(),
                }));
            }
            return Err(StageError::Terminal(SchedulerError::JobExecuteFailure(
                format!("更新请求为READY失败: {err}"),
            )));
        }
        self.execution = Some(execution.clone());

        let event = JobExecutionLaunchEvent::new(&execution);
        let published = match event.to_payload() {
            Ok(payload) => {
                self.ctx
                    .queue
                    .publish(&self.ctx.topics.job_launch_topic, &event.headers(), &payload)
                    .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            return self.revert_to_pending(&execution, err).await;
        }

        self.ctx.stats.started(&self.request);
        self.ctx.metrics.record_scheduled(1);
        info!(
            job_execution_id = %execution.id,
            tasks = execution.reservations.len(),
            "作业已下发"
        );
        Ok(ScheduleOutcome::Scheduled {
            job_execution_id: execution.id,
        })
    }

    /// 数据库写入成功但下发失败：撤销预留与执行记录，请求回到PENDING
    async fn revert_to_pending(
        &mut self,
        execution: &JobExecution,
        cause: SchedulerError,
    ) -> StageResult<ScheduleOutcome> {
        warn!("下发作业失败，请求改回PENDING: {cause}");
        self.ctx.metrics.record_dispatch_publish_failure();
        self.ctx.resources.release_job_resources(self.request.id);

        let repos = &self.ctx.repositories;
        repos.job_requests.revert_to_pending(self.request.id).await?;
        self.discard_execution(execution).await;
        self.execution = None;

        self.ctx.stats.pending(&self.request, false);
        self.ctx.metrics.record_reverted_to_pending();
        Ok(ScheduleOutcome::Reverted)
    }

    /// 删除未下发的执行记录，删除失败时改为CANCELLED，避免阻塞后续尝试
    async fn discard_execution(&self, execution: &JobExecution) {
        let repos = &self.ctx.repositories;
        let Err(e) = repos.job_executions.delete(&execution.id).await else {
            return;
        };
        warn!(job_execution_id = %execution.id, "删除执行记录失败，改为取消: {e}");
        if let Err(e) = repos
            .job_executions
            .update_state(&execution.id, JobState::Cancelled)
            .await
        {
            error!(job_execution_id = %execution.id, "取消执行记录失败: {e}");
        }
    }

    async fn cancel_stale_executions(&self) {
        let repos = &self.ctx.repositories;
        let executions = match repos.job_executions.find_by_request(self.request.id).await {
            Ok(executions) => executions,
            Err(e) => {
                warn!("读取残留执行记录失败: {e}");
                return;
            }
        };
        for stale in executions.iter().filter(|e| !e.job_state.is_terminal()) {
            warn!(job_execution_id = %stale.id, "取消PENDING请求残留的执行记录");
            if let Err(e) = repos
                .job_executions
                .update_state(&stale.id, JobState::Cancelled)
                .await
            {
                warn!(job_execution_id = %stale.id, "取消执行记录失败: {e}");
            }
        }
    }

    /// 资源或并发不足：按重试策略推迟，尝试次数用尽时终态失败
    async fn not_ready(mut self, err: SchedulerError) -> SchedulerResult<ScheduleOutcome> {
        let message = err.to_string();
        self.ctx
            .stats
            .set_ants_available(&self.request, false, Some(message.clone()));

        let policy = RetryPolicy::from_config(&self.ctx.jobs);
        match plan_retry(self.request.schedule_attempts, self.request.job_priority, &policy) {
            RetryPlan::Exhausted { attempts } => {
                let err = SchedulerError::AntResourcesUnavailable(format!(
                    "{attempts} 次调度尝试后仍没有可用资源: {message}"
                ));
                self.schedule_failed(err).await
            }
            RetryPlan::Retry {
                attempts,
                delay,
                decrement_priority,
            } => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|e| SchedulerError::Internal(e.to_string()))?;
                let scheduled_at = self.request.scheduled_at + delay;
                let updated = self
                    .ctx
                    .repositories
                    .job_requests
                    .increment_schedule_attempts(
                        self.request.id,
                        scheduled_at,
                        decrement_priority,
                        &message,
                    )
                    .await?;
                if !updated {
                    debug!("请求已不是PENDING，放弃本次重试");
                    return Ok(ScheduleOutcome::Skipped {
                        reason: "请求已被其他调度尝试处理".to_string(),
                    });
                }

                self.request.schedule_attempts = attempts;
                self.request.scheduled_at = scheduled_at;
                self.request.job_priority -= decrement_priority;
                self.ctx.stats.pending(&self.request, false);
                self.ctx.metrics.record_will_retry(&self.request.job_type);
                debug!(%scheduled_at, "资源不足，稍后重试: {message}");
                Ok(ScheduleOutcome::Retry {
                    attempts,
                    scheduled_at,
                })
            }
        }
    }

    /// 终态失败：请求置为FAILED并记录错误码，释放预留，执行记录一并置为失败
    async fn schedule_failed(self, err: SchedulerError) -> SchedulerResult<ScheduleOutcome> {
        let category =
            ErrorCategory::from_error(&err).unwrap_or(ErrorCategory::JobExecuteFailure);
        let message = err.to_string();
        let repos = &self.ctx.repositories;

        // 只有本次尝试自己置为READY时才允许从READY失败
        let expected: &[JobState] = if self.execution.is_some() {
            &[JobState::Pending, JobState::Ready]
        } else {
            &[JobState::Pending]
        };
        let updated = repos
            .job_requests
            .update_job_state(
                self.request.id,
                expected,
                JobState::Failed,
                Some(category.error_code()),
                Some(&message),
            )
            .await?;
        if !updated {
            debug!("请求已不是PENDING，忽略失败: {message}");
            return Ok(ScheduleOutcome::Skipped {
                reason: "请求已被其他调度尝试处理".to_string(),
            });
        }
        self.ctx.resources.release_job_resources(self.request.id);
        if let Some(execution) = &self.execution {
            if let Err(e) = repos
                .job_executions
                .update_state(&execution.id, JobState::Failed)
                .await
            {
                warn!(job_execution_id = %execution.id, "更新执行记录状态失败: {e}");
            }
        }

        self.ctx.stats.remove_pending(&self.request);
        self.ctx
            .metrics
            .record_schedule_failed(&self.request.job_type, category.error_code());
        warn!(error_code = category.error_code(), "调度失败: {message}");
        Ok(ScheduleOutcome::Failed { category, message })
    }
}
