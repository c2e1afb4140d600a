use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use scheduler_core::{
    config::{JobsConfig, MessageQueueConfig},
    LeaseStore, MessageQueue, SchedulerError, SchedulerResult,
};
use scheduler_domain::events::{DomainEvent, JobSchedulerLeaderEvent};
use scheduler_infrastructure::SchedulerMetrics;

/// 调度器之间竞争的租约名
pub const LEADER_LEASE_NAME: &str = "job-scheduler-leader";

/// 基于租约的领导者选举
///
/// 持有租约的实例才会执行调度与各项清理；未启用选举时本实例始终视为领导者。
pub struct LeaderElection {
    server_id: String,
    enabled: bool,
    ttl: Duration,
    topic: String,
    leases: Arc<dyn LeaseStore>,
    queue: Arc<dyn MessageQueue>,
    metrics: SchedulerMetrics,
    leader: AtomicBool,
    /// 最近一次成功续期后租约的到期时间（毫秒时间戳），0表示未持有
    lease_expires_at_ms: AtomicI64,
}

impl LeaderElection {
    pub fn new(
        server_id: impl Into<String>,
        jobs: &JobsConfig,
        topics: &MessageQueueConfig,
        leases: Arc<dyn LeaseStore>,
        queue: Arc<dyn MessageQueue>,
        metrics: SchedulerMetrics,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            enabled: jobs.leader_election_enabled,
            ttl: jobs.leader_lease_ttl(),
            topic: topics.leader_topic.clone(),
            leases,
            queue,
            metrics,
            leader: AtomicBool::new(false),
            lease_expires_at_ms: AtomicI64::new(0),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// 续期停滞时租约过期即视为失去领导权，不等下一次心跳
    pub fn is_leader(&self) -> bool {
        if !self.enabled {
            return true;
        }
        self.leader.load(Ordering::SeqCst)
            && Utc::now().timestamp_millis() < self.lease_expires_at_ms.load(Ordering::SeqCst)
    }

    fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// 当前租约持有者
    pub async fn current_leader(&self) -> SchedulerResult<Option<String>> {
        if !self.enabled {
            return Ok(Some(self.server_id.clone()));
        }
        self.leases.holder(LEADER_LEASE_NAME).await
    }

    /// 获取或续期租约，成功时发布领导者心跳
    ///
    /// 租约存储不可用时本实例立即放弃领导权。
    pub async fn heartbeat(&self) -> SchedulerResult<bool> {
        let renewed_at = Utc::now();
        let acquired = if self.enabled {
            match self
                .leases
                .try_acquire(LEADER_LEASE_NAME, &self.server_id, self.ttl)
                .await
            {
                Ok(acquired) => acquired,
                Err(e) => {
                    self.lease_expires_at_ms.store(0, Ordering::SeqCst);
                    if self.leader.swap(false, Ordering::SeqCst) {
                        warn!(server_id = %self.server_id, "续期领导者租约失败，放弃领导权: {e}");
                    }
                    return Err(SchedulerError::LeadershipLost(e.to_string()));
                }
            }
        } else {
            true
        };

        let expires_at = if acquired {
            (renewed_at + self.lease_ttl()).timestamp_millis()
        } else {
            0
        };
        self.lease_expires_at_ms.store(expires_at, Ordering::SeqCst);
        let was_leader = self.leader.swap(acquired, Ordering::SeqCst);
        match (was_leader, acquired) {
            (false, true) => info!(server_id = %self.server_id, "成为调度器领导者"),
            (true, false) => warn!(server_id = %self.server_id, "失去调度器领导权"),
            _ => {}
        }

        if acquired {
            self.publish_heartbeat().await;
        } else {
            debug!(server_id = %self.server_id, "租约由其他实例持有");
        }
        Ok(acquired)
    }

    async fn publish_heartbeat(&self) {
        let now = Utc::now();
        let event = JobSchedulerLeaderEvent {
            server_id: self.server_id.clone(),
            lease_expires_at: now + self.lease_ttl(),
            created_at: now,
        };
        let published = match event.to_payload() {
            Ok(payload) => self.queue.publish(&self.topic, &event.headers(), &payload).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(_) => self.metrics.record_leader_heartbeat(),
            Err(e) => warn!("发布领导者心跳失败: {e}"),
        }
    }

    /// 主动释放租约，便于其他实例尽快接替
    pub async fn resign(&self) -> SchedulerResult<()> {
        self.lease_expires_at_ms.store(0, Ordering::SeqCst);
        if self.enabled && self.leader.swap(false, Ordering::SeqCst) {
            self.leases.release(LEADER_LEASE_NAME, &self.server_id).await?;
            info!(server_id = %self.server_id, "已释放领导者租约");
        }
        Ok(())
    }
}
