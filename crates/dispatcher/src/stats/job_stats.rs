use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rolling_stat::{LatencySummary, RollingMinMax};

/// 每个作业类型保留的延迟样本数
pub const LATENCY_WINDOW: usize = 20;

/// 单个作业类型(`<组织或用户>-<作业类型>`)的运行统计
///
/// 计数器是原子变量，时间戳与延迟样本放在一把短持有的互斥锁里。
#[derive(Debug)]
pub struct JobStats {
    key: String,
    job_type: String,
    succeeded: AtomicU64,
    failed: AtomicU64,
    paused: AtomicU64,
    cancelled: AtomicU64,
    executing: AtomicI64,
    details: Mutex<StatsDetails>,
}

#[derive(Debug)]
struct StatsDetails {
    first_job_at: Option<DateTime<Utc>>,
    last_job_at: Option<DateTime<Utc>>,
    ants_available: bool,
    ant_unavailable_error: Option<String>,
    job_disabled: bool,
    ants_capacity: usize,
    succeeded_latency: RollingMinMax,
    failed_latency: RollingMinMax,
    paused_latency: RollingMinMax,
}

/// `JobStats::calculate` 生成的只读快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatsSnapshot {
    pub key: String,
    pub job_type: String,
    pub first_job_at: Option<DateTime<Utc>>,
    pub last_job_at: Option<DateTime<Utc>>,
    pub succeeded_jobs: u64,
    pub failed_jobs: u64,
    pub paused_jobs: u64,
    pub cancelled_jobs: u64,
    pub executing_jobs: i64,
    /// 成功数占成功+失败的百分比
    pub succeeded_percentage: u64,
    pub succeeded_latency: LatencySummary,
    pub failed_latency: LatencySummary,
    pub paused_latency: LatencySummary,
    pub ants_available: bool,
    pub ant_unavailable_error: Option<String>,
    pub job_disabled: bool,
    pub ants_capacity: usize,
}

impl JobStats {
    pub fn new(key: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            job_type: job_type.into(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            paused: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            executing: AtomicI64::new(0),
            details: Mutex::new(StatsDetails {
                first_job_at: None,
                last_job_at: None,
                ants_available: false,
                ant_unavailable_error: None,
                job_disabled: false,
                ants_capacity: 0,
                succeeded_latency: RollingMinMax::new(LATENCY_WINDOW),
                failed_latency: RollingMinMax::new(LATENCY_WINDOW),
                paused_latency: RollingMinMax::new(LATENCY_WINDOW),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    fn details(&self) -> MutexGuard<'_, StatsDetails> {
        self.details.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_executing(&self) {
        let _ = self
            .executing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n - 1).max(0)));
    }

    /// 作业开始执行：Ant显然可用，清除之前记录的不可用原因
    pub fn started(&self, now: DateTime<Utc>) {
        self.executing.fetch_add(1, Ordering::SeqCst);
        let mut details = self.details();
        details.ants_available = true;
        details.ant_unavailable_error = None;
        details.last_job_at = Some(now);
        if details.first_job_at.is_none() {
            details.first_job_at = Some(now);
        }
    }

    pub fn succeeded(&self, latency: Duration) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.finish_executing();
        self.details().succeeded_latency.add(latency.as_secs_f64());
    }

    pub fn failed(&self, latency: Duration) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.finish_executing();
        self.details().failed_latency.add(latency.as_secs_f64());
    }

    pub fn paused(&self, latency: Duration) {
        self.paused.fetch_add(1, Ordering::SeqCst);
        self.finish_executing();
        self.details().paused_latency.add(latency.as_secs_f64());
    }

    pub fn cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        self.finish_executing();
    }

    /// 已下发的请求被改回PENDING
    pub fn reverted_pending(&self) {
        self.finish_executing();
    }

    pub fn set_ants_available(&self, available: bool, error: Option<String>) {
        let mut details = self.details();
        details.ants_available = available;
        details.ant_unavailable_error = if available { None } else { error };
    }

    pub fn set_ants_capacity(&self, capacity: usize) {
        self.details().ants_capacity = capacity;
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.details().job_disabled = disabled;
    }

    pub fn executing(&self) -> i64 {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn last_job_at(&self) -> Option<DateTime<Utc>> {
        self.details().last_job_at
    }

    /// 成功作业的平均延迟
    pub fn succeeded_average(&self) -> Duration {
        Duration::from_secs_f64(self.details().succeeded_latency.average())
    }

    pub fn calculate(&self) -> JobStatsSnapshot {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let succeeded_percentage = if succeeded + failed > 0 {
            succeeded * 100 / (succeeded + failed)
        } else {
            0
        };
        let details = self.details();
        JobStatsSnapshot {
            key: self.key.clone(),
            job_type: self.job_type.clone(),
            first_job_at: details.first_job_at,
            last_job_at: details.last_job_at,
            succeeded_jobs: succeeded,
            failed_jobs: failed,
            paused_jobs: self.paused.load(Ordering::SeqCst),
            cancelled_jobs: self.cancelled.load(Ordering::SeqCst),
            executing_jobs: self.executing(),
            succeeded_percentage,
            succeeded_latency: details.succeeded_latency.summary(),
            failed_latency: details.failed_latency.summary(),
            paused_latency: details.paused_latency.summary(),
            ants_available: details.ants_available,
            ant_unavailable_error: details.ant_unavailable_error.clone(),
            job_disabled: details.job_disabled,
            ants_capacity: details.ants_capacity,
        }
    }
}
