use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 作业调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// 资源预留的最长保留时间（秒），超过后由回收器释放
    pub ant_reservation_timeout_seconds: u64,
    /// Ant注册的存活超时（秒），超过未收到心跳即视为不可用
    pub ant_registration_alive_timeout_seconds: u64,
    /// 领导者租约续期与心跳发布间隔（秒）
    pub job_scheduler_leader_interval_seconds: u64,
    /// 检查待调度作业的间隔（秒）
    pub check_pending_jobs_interval_seconds: u64,
    /// READY/STARTED/EXECUTING 状态超过该时间未更新即视为孤儿请求（秒）
    pub orphan_requests_timeout_seconds: u64,
    /// 孤儿请求扫描间隔（秒）
    pub orphan_requests_update_interval_seconds: u64,
    /// 补偿缺失的cron作业的扫描间隔（秒）
    pub missing_cron_jobs_interval_seconds: u64,
    /// 资源不足时单次推迟的最长时间（秒）
    pub not_ready_max_wait_seconds: u64,
    /// 最大调度尝试次数，超过后请求失败
    pub max_schedule_attempts: u32,
    pub pending_batch_size: usize,
    pub max_no_jobs_tries: u32,
    pub missing_cron_chunk_size: usize,
    pub health_check_timeout_seconds: u64,
    /// 排队估算只统计该时间窗口内即将调度的请求（秒）
    pub wait_estimate_horizon_seconds: u64,
    pub container_event_log_capacity: usize,
    pub leader_election_enabled: bool,
    pub leader_lease_ttl_seconds: u64,
    pub subscription_quota_enabled: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            ant_reservation_timeout_seconds: 3600,
            ant_registration_alive_timeout_seconds: 15,
            job_scheduler_leader_interval_seconds: 15,
            check_pending_jobs_interval_seconds: 1,
            orphan_requests_timeout_seconds: 60,
            orphan_requests_update_interval_seconds: 15,
            missing_cron_jobs_interval_seconds: 60,
            not_ready_max_wait_seconds: 30,
            max_schedule_attempts: 10000,
            pending_batch_size: 1000,
            max_no_jobs_tries: 10,
            missing_cron_chunk_size: 100,
            health_check_timeout_seconds: 5,
            wait_estimate_horizon_seconds: 60,
            container_event_log_capacity: 10000,
            leader_election_enabled: true,
            leader_lease_ttl_seconds: 45,
            subscription_quota_enabled: true,
        }
    }
}

impl JobsConfig {
    pub fn ant_reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.ant_reservation_timeout_seconds)
    }

    pub fn ant_registration_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.ant_registration_alive_timeout_seconds)
    }

    pub fn leader_interval(&self) -> Duration {
        Duration::from_secs(self.job_scheduler_leader_interval_seconds)
    }

    pub fn check_pending_jobs_interval(&self) -> Duration {
        Duration::from_secs(self.check_pending_jobs_interval_seconds)
    }

    pub fn orphan_requests_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_requests_timeout_seconds)
    }

    pub fn orphan_requests_update_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_requests_update_interval_seconds)
    }

    pub fn missing_cron_jobs_interval(&self) -> Duration {
        Duration::from_secs(self.missing_cron_jobs_interval_seconds)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }

    pub fn leader_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_lease_ttl_seconds)
    }

    pub fn wait_estimate_horizon(&self) -> Duration {
        Duration::from_secs(self.wait_estimate_horizon_seconds)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let intervals = [
            ("ant_reservation_timeout_seconds", self.ant_reservation_timeout_seconds),
            (
                "ant_registration_alive_timeout_seconds",
                self.ant_registration_alive_timeout_seconds,
            ),
            (
                "job_scheduler_leader_interval_seconds",
                self.job_scheduler_leader_interval_seconds,
            ),
            (
                "check_pending_jobs_interval_seconds",
                self.check_pending_jobs_interval_seconds,
            ),
            ("orphan_requests_timeout_seconds", self.orphan_requests_timeout_seconds),
            (
                "orphan_requests_update_interval_seconds",
                self.orphan_requests_update_interval_seconds,
            ),
            (
                "missing_cron_jobs_interval_seconds",
                self.missing_cron_jobs_interval_seconds,
            ),
            ("health_check_timeout_seconds", self.health_check_timeout_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(anyhow::anyhow!("{name} 必须大于0"));
            }
        }

        if self.max_schedule_attempts == 0 {
            return Err(anyhow::anyhow!("最大调度尝试次数必须大于0"));
        }

        if self.pending_batch_size == 0 || self.missing_cron_chunk_size == 0 {
            return Err(anyhow::anyhow!("批量大小必须大于0"));
        }

        if self.leader_election_enabled
            && self.leader_lease_ttl_seconds <= self.job_scheduler_leader_interval_seconds
        {
            return Err(anyhow::anyhow!(
                "领导者租约时长({}秒)必须大于续期间隔({}秒)",
                self.leader_lease_ttl_seconds,
                self.job_scheduler_leader_interval_seconds
            ));
        }

        Ok(())
    }
}
