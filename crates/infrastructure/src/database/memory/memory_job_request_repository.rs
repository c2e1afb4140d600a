use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{JobRequestInfo, JobState, JobTypeCronTrigger},
    repositories::JobRequestRepository,
};

/// 内存作业请求仓储，用于嵌入式部署和测试
#[derive(Debug)]
pub struct MemoryJobRequestRepository {
    requests: RwLock<HashMap<u64, JobRequestInfo>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl Default for MemoryJobRequestRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobRequestRepository {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// 模拟存储不可用，之后的所有操作都返回错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> SchedulerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation(
                "作业请求存储不可用".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn all(&self) -> Vec<JobRequestInfo> {
        let mut requests: Vec<_> = self.requests.read().await.values().cloned().collect();
        requests.sort_by_key(|r| r.id);
        requests
    }

    /// 测试辅助：直接修改存储中的请求
    pub async fn update_with<F>(&self, id: u64, f: F) -> SchedulerResult<()>
    where
        F: FnOnce(&mut JobRequestInfo),
    {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or(SchedulerError::JobRequestNotFound { id })?;
        f(request);
        Ok(())
    }
}

fn same_owner(trigger: &JobTypeCronTrigger, request: &JobRequestInfo) -> bool {
    match (&trigger.organization_id, &request.organization_id) {
        (Some(a), Some(b)) if !a.is_empty() && a == b => true,
        _ => trigger.user_id == request.user_id,
    }
}

#[async_trait]
impl JobRequestRepository for MemoryJobRequestRepository {
    async fn get(&self, id: u64) -> SchedulerResult<JobRequestInfo> {
        self.check_available()?;
        self.requests
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::JobRequestNotFound { id })
    }

    async fn save(&self, request: &JobRequestInfo) -> SchedulerResult<JobRequestInfo> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        if let Some(user_key) = &request.user_key {
            let duplicate = requests.values().any(|existing| {
                existing.id != request.id && existing.user_key.as_ref() == Some(user_key)
            });
            if duplicate {
                return Err(SchedulerError::StateConflict(format!(
                    "user_key重复: {user_key}"
                )));
            }
        }

        let mut saved = request.clone();
        if saved.id == 0 {
            saved.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        }
        saved.updated_at = Utc::now();
        requests.insert(saved.id, saved.clone());
        debug!("保存作业请求: {}", saved);
        Ok(saved)
    }

    async fn delete(&self, id: u64) -> SchedulerResult<()> {
        self.check_available()?;
        self.requests
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(SchedulerError::JobRequestNotFound { id })
    }

    async fn next_schedulable_job_requests_by_type(
        &self,
        job_types: &[String],
        limit: usize,
    ) -> SchedulerResult<Vec<JobRequestInfo>> {
        self.check_available()?;
        let now = Utc::now();
        let requests = self.requests.read().await;
        let mut pending: Vec<JobRequestInfo> = requests
            .values()
            .filter(|r| r.job_state.is_pending() && r.scheduled_at <= now)
            .filter(|r| job_types.is_empty() || job_types.contains(&r.job_type))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.job_priority
                .cmp(&a.job_priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn increment_schedule_attempts(
        &self,
        id: u64,
        scheduled_at: DateTime<Utc>,
        decrement_priority: i32,
        error_message: &str,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or(SchedulerError::JobRequestNotFound { id })?;
        if request.job_state != JobState::Pending {
            return Ok(false);
        }
        request.schedule_attempts += 1;
        request.scheduled_at = scheduled_at;
        request.job_priority -= decrement_priority;
        request.error_message = Some(error_message.to_string());
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn requeue_orphan_job_requests(&self, stale: Duration) -> SchedulerResult<Vec<u64>> {
        self.check_available()?;
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(stale)
                .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let mut requests = self.requests.write().await;
        let mut requeued = Vec::new();
        for request in requests.values_mut() {
            if request.job_state.can_requeue_orphan() && request.updated_at < cutoff {
                request.job_state = JobState::Pending;
                request.scheduled_at = now;
                request.updated_at = now;
                requeued.push(request.id);
            }
        }
        requeued.sort_unstable();
        Ok(requeued)
    }

    async fn find_missing_cron_scheduled_jobs_by_type(
        &self,
        triggers: &[JobTypeCronTrigger],
    ) -> SchedulerResult<Vec<JobTypeCronTrigger>> {
        self.check_available()?;
        let requests = self.requests.read().await;
        Ok(triggers
            .iter()
            .filter(|trigger| {
                !requests.values().any(|request| {
                    request.cron_triggered
                        && !request.job_state.is_terminal()
                        && request.job_type == trigger.job_type
                        && same_owner(trigger, request)
                })
            })
            .cloned()
            .collect())
    }

    async fn update_job_state(
        &self,
        id: u64,
        expected: &[JobState],
        new_state: JobState,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or(SchedulerError::JobRequestNotFound { id })?;
        if !expected.contains(&request.job_state) {
            return Ok(false);
        }
        request.job_state = new_state;
        request.error_code = error_code.map(str::to_string);
        request.error_message = error_message.map(str::to_string);
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_ready_to_execute(&self, id: u64, job_execution_id: &str) -> SchedulerResult<()> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or(SchedulerError::JobRequestNotFound { id })?;
        if !request.job_state.is_pending() {
            return Err(SchedulerError::StateConflict(format!(
                "请求 {id} 当前状态为 {}，无法置为READY",
                request.job_state
            )));
        }
        request.job_state = JobState::Ready;
        request.last_job_execution_id = Some(job_execution_id.to_string());
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn revert_to_pending(&self, id: u64) -> SchedulerResult<bool> {
        self.check_available()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or(SchedulerError::JobRequestNotFound { id })?;
        if request.job_state != JobState::Ready {
            return Ok(false);
        }
        request.job_state = JobState::Pending;
        request.last_job_execution_id = None;
        request.updated_at = Utc::now();
        Ok(true)
    }
}
