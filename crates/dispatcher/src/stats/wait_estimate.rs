use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job_stats::JobStatsSnapshot;

/// 假定执行中的作业里有七成即将结束
pub const EXECUTING_WEIGHT: f64 = 0.7;

/// 某个请求的排队位置与预计等待时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobWaitEstimate {
    pub key: String,
    pub stats: JobStatsSnapshot,
    /// 排在近期调度窗口内的待调度请求，按调度先后排列
    pub pending_job_ids: Vec<u64>,
    pub job_request_id: Option<u64>,
    /// 从0开始的排队序号
    pub queue_number: Option<usize>,
    pub estimated_wait: Option<Duration>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobWaitEstimate {
    pub fn pending_jobs(&self) -> usize {
        self.pending_job_ids.len()
    }

    pub(crate) fn estimate(
        position: usize,
        executing: i64,
        available_ants: usize,
        average: Duration,
    ) -> Option<Duration> {
        if available_ants == 0 || average.is_zero() {
            return None;
        }
        let total = (position + 1) as f64 + EXECUTING_WEIGHT * executing.max(0) as f64;
        Some(average.mul_f64(total / available_ants as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_formula() {
        let eta = JobWaitEstimate::estimate(1, 10, 3, Duration::from_secs(30)).unwrap();
        // (1 + 1 + 0.7 * 10) / 3 * 30s = 90s
        assert_eq!(eta.as_secs(), 90);

        assert!(JobWaitEstimate::estimate(0, 0, 0, Duration::from_secs(30)).is_none());
        assert!(JobWaitEstimate::estimate(0, 0, 2, Duration::ZERO).is_none());
    }
}
