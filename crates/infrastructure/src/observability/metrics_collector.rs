//! 调度器指标
//!
//! 基于 `metrics` 门面记录，未安装导出器时所有调用都是空操作。

use std::time::Duration;

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

/// 调度器的计数器、仪表与直方图
#[derive(Clone)]
pub struct SchedulerMetrics {
    checked_pending_total: Counter,
    scheduled_jobs_total: Counter,
    bad_health_total: Counter,
    no_more_jobs_total: Counter,
    shutting_down_total: Counter,
    reverted_to_pending_total: Counter,
    orphan_requeued_total: Counter,
    missing_cron_jobs_total: Counter,
    leader_heartbeats_total: Counter,
    dispatch_publish_failures_total: Counter,
    no_jobs_backoff: Gauge,
    registered_ants: Gauge,
    pass_duration: Histogram,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            checked_pending_total: counter!("scheduler_checked_pending_total"),
            scheduled_jobs_total: counter!("scheduler_scheduled_jobs_total"),
            bad_health_total: counter!("scheduler_bad_health_total"),
            no_more_jobs_total: counter!("scheduler_no_more_jobs_total"),
            shutting_down_total: counter!("scheduler_shutting_down_total"),
            reverted_to_pending_total: counter!("scheduler_job_reverted_to_pending_total"),
            orphan_requeued_total: counter!("scheduler_orphan_requeued_total"),
            missing_cron_jobs_total: counter!("scheduler_missing_cron_jobs_total"),
            leader_heartbeats_total: counter!("scheduler_leader_heartbeats_total"),
            dispatch_publish_failures_total: counter!("scheduler_dispatch_publish_failures_total"),
            no_jobs_backoff: gauge!("scheduler_no_jobs_backoff"),
            registered_ants: gauge!("scheduler_registered_ants"),
            pass_duration: histogram!("scheduler_pass_duration_seconds"),
        }
    }

    pub fn record_checked_pending(&self) {
        self.checked_pending_total.increment(1);
    }

    pub fn record_scheduled(&self, count: u64) {
        self.scheduled_jobs_total.increment(count);
    }

    pub fn record_bad_health(&self) {
        self.bad_health_total.increment(1);
    }

    pub fn record_no_more_jobs(&self) {
        self.no_more_jobs_total.increment(1);
    }

    pub fn record_shutting_down(&self) {
        self.shutting_down_total.increment(1);
    }

    /// 按错误码统计调度失败
    pub fn record_schedule_failed(&self, job_type: &str, error_code: &str) {
        counter!(
            "scheduler_failed_total",
            "job_type" => job_type.to_string(),
            "error_code" => error_code.to_string()
        )
        .increment(1);
        debug!(job_type = job_type, error_code = error_code, "记录调度失败");
    }

    pub fn record_will_retry(&self, job_type: &str) {
        counter!("scheduler_will_retry_total", "job_type" => job_type.to_string()).increment(1);
    }

    pub fn record_reverted_to_pending(&self) {
        self.reverted_to_pending_total.increment(1);
    }

    pub fn record_orphans_requeued(&self, count: u64) {
        self.orphan_requeued_total.increment(count);
    }

    pub fn record_missing_cron_jobs(&self, count: u64) {
        self.missing_cron_jobs_total.increment(count);
    }

    pub fn record_leader_heartbeat(&self) {
        self.leader_heartbeats_total.increment(1);
    }

    pub fn record_dispatch_publish_failure(&self) {
        self.dispatch_publish_failures_total.increment(1);
    }

    pub fn set_no_jobs_backoff(&self, tries: u32) {
        self.no_jobs_backoff.set(tries as f64);
    }

    pub fn set_registered_ants(&self, count: usize) {
        self.registered_ants.set(count as f64);
    }

    pub fn record_pass_duration(&self, elapsed: Duration) {
        self.pass_duration.record(elapsed.as_secs_f64());
    }
}
