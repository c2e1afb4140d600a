use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{JobExecution, JobState},
    repositories::JobExecutionRepository,
};

/// 内存作业执行记录仓储
#[derive(Debug, Default)]
pub struct MemoryJobExecutionRepository {
    executions: RwLock<HashMap<String, JobExecution>>,
    unavailable: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryJobExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 只让删除失败，其余操作照常
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> SchedulerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation(
                "作业执行存储不可用".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.executions.read().await.len()
    }
}

#[async_trait]
impl JobExecutionRepository for MemoryJobExecutionRepository {
    async fn create(&self, execution: &JobExecution) -> SchedulerResult<JobExecution> {
        self.check_available()?;
        let mut executions = self.executions.write().await;
        let live = executions.values().any(|existing| {
            existing.job_request_id == execution.job_request_id
                && !existing.job_state.is_terminal()
        });
        if live {
            return Err(SchedulerError::StateConflict(format!(
                "请求 {} 已有未结束的执行记录",
                execution.job_request_id
            )));
        }
        executions.insert(execution.id.clone(), execution.clone());
        Ok(execution.clone())
    }

    async fn get(&self, id: &str) -> SchedulerResult<JobExecution> {
        self.executions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobExecutionNotFound { id: id.to_string() })
    }

    async fn find_by_request(&self, job_request_id: u64) -> SchedulerResult<Vec<JobExecution>> {
        self.check_available()?;
        let mut executions: Vec<JobExecution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.job_request_id == job_request_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.created_at);
        Ok(executions)
    }

    async fn update_state(&self, id: &str, state: JobState) -> SchedulerResult<()> {
        self.check_available()?;
        let mut executions = self.executions.write().await;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| SchedulerError::JobExecutionNotFound { id: id.to_string() })?;
        execution.job_state = state;
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> SchedulerResult<()> {
        self.check_available()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation("删除执行记录失败".to_string()));
        }
        self.executions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::JobExecutionNotFound { id: id.to_string() })
    }
}
