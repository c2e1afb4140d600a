use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use scheduler_domain::entities::{JobRequestInfo, JobState};

use super::job_stats::{JobStats, JobStatsSnapshot};
use super::wait_estimate::JobWaitEstimate;

/// 只有在该时间窗口内到期的请求才计入排队
pub const DEFAULT_WAIT_HORIZON: Duration = Duration::from_secs(60);

#[derive(Default)]
struct RegistryState {
    stats_by_key: HashMap<String, Arc<JobStats>>,
    /// 用户 -> 执行中的请求
    executing_by_user: HashMap<String, HashSet<u64>>,
    /// 组织 -> 执行中的请求
    executing_by_org: HashMap<String, HashSet<u64>>,
    pending_by_key: HashMap<String, HashMap<u64, JobRequestInfo>>,
    last_job_status: HashMap<String, JobState>,
}

impl RegistryState {
    fn stats_for(&mut self, request: &JobRequestInfo) -> Arc<JobStats> {
        let key = request.user_job_type_key();
        self.stats_by_key
            .entry(key.clone())
            .or_insert_with(|| Arc::new(JobStats::new(key, request.job_type.clone())))
            .clone()
    }

    fn remove_pending(&mut self, request: &JobRequestInfo) {
        let key = request.user_job_type_key();
        if let Some(pending) = self.pending_by_key.get_mut(&key) {
            pending.remove(&request.id);
            if pending.is_empty() {
                self.pending_by_key.remove(&key);
            }
        }
    }

    fn add_executing(&mut self, request: &JobRequestInfo) {
        self.executing_by_user
            .entry(request.user_id.clone())
            .or_default()
            .insert(request.id);
        if let Some(org) = non_empty(request.organization_id.as_deref()) {
            self.executing_by_org
                .entry(org.to_string())
                .or_default()
                .insert(request.id);
        }
    }

    fn remove_executing(&mut self, request: &JobRequestInfo) {
        if let Some(ids) = self.executing_by_user.get_mut(&request.user_id) {
            ids.remove(&request.id);
            if ids.is_empty() {
                self.executing_by_user.remove(&request.user_id);
            }
        }
        if let Some(org) = non_empty(request.organization_id.as_deref()) {
            if let Some(ids) = self.executing_by_org.get_mut(org) {
                ids.remove(&request.id);
                if ids.is_empty() {
                    self.executing_by_org.remove(org);
                }
            }
        }
    }

    fn finished(&mut self, request: &JobRequestInfo, state: JobState) -> Arc<JobStats> {
        let stats = self.stats_for(request);
        self.remove_pending(request);
        self.remove_executing(request);
        self.last_job_status
            .insert(request.user_job_type_key(), state);
        stats
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// 进程内的作业统计注册表
///
/// 只存在于内存中，重启后从零开始重建。读路径（统计查询、排队估算）与
/// 调度路径并发访问；映射结构由读写锁保护，计数器本身是原子的。
pub struct StatsRegistry {
    state: RwLock<RegistryState>,
    wait_horizon: Duration,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::with_wait_horizon(DEFAULT_WAIT_HORIZON)
    }

    pub fn with_wait_horizon(wait_horizon: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            wait_horizon,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 记录待调度请求；`reverted` 表示请求是从已下发状态改回PENDING的
    pub fn pending(&self, request: &JobRequestInfo, reverted: bool) {
        let mut state = self.write();
        let stats = state.stats_for(request);
        state
            .pending_by_key
            .entry(request.user_job_type_key())
            .or_default()
            .insert(request.id, request.clone());
        state.remove_executing(request);
        drop(state);
        if reverted {
            stats.reverted_pending();
        }
    }

    pub fn remove_pending(&self, request: &JobRequestInfo) {
        self.write().remove_pending(request);
    }

    pub fn started(&self, request: &JobRequestInfo) {
        let mut state = self.write();
        let stats = state.stats_for(request);
        state.remove_pending(request);
        state.add_executing(request);
        drop(state);
        stats.started(Utc::now());
        debug!(request_id = request.id, key = %stats.key(), "作业开始执行");
    }

    pub fn succeeded(&self, request: &JobRequestInfo, latency: Duration) {
        self.write()
            .finished(request, JobState::Completed)
            .succeeded(latency);
    }

    pub fn failed(&self, request: &JobRequestInfo, latency: Duration) {
        self.write()
            .finished(request, JobState::Failed)
            .failed(latency);
    }

    pub fn paused(&self, request: &JobRequestInfo, latency: Duration) {
        self.write()
            .finished(request, JobState::Paused)
            .paused(latency);
    }

    pub fn cancelled(&self, request: &JobRequestInfo) {
        self.write()
            .finished(request, JobState::Cancelled)
            .cancelled();
    }

    pub fn set_ants_available(&self, request: &JobRequestInfo, available: bool, error: Option<String>) {
        self.write()
            .stats_for(request)
            .set_ants_available(available, error);
    }

    pub fn set_disabled(&self, request: &JobRequestInfo, disabled: bool) {
        self.write().stats_for(request).set_disabled(disabled);
    }

    /// 某个作业类型当前执行中的数量
    pub fn get_execution_count(&self, key: &str) -> i64 {
        self.read()
            .stats_by_key
            .get(key)
            .map(|stats| stats.executing())
            .unwrap_or(0)
    }

    /// 请求所属用户、组织各自执行中的请求数
    pub fn user_org_executing(&self, request: &JobRequestInfo) -> (usize, usize) {
        let state = self.read();
        let by_user = state
            .executing_by_user
            .get(&request.user_id)
            .map(HashSet::len)
            .unwrap_or(0);
        let by_org = non_empty(request.organization_id.as_deref())
            .and_then(|org| state.executing_by_org.get(org))
            .map(HashSet::len)
            .unwrap_or(0);
        (by_user, by_org)
    }

    pub fn last_job_status(&self, key: &str) -> Option<JobState> {
        self.read().last_job_status.get(key).copied()
    }

    /// 按最近活动时间分页，页内按key排序
    pub fn get_stats(&self, offset: usize, limit: usize) -> Vec<JobStatsSnapshot> {
        let mut all: Vec<Arc<JobStats>> = self.read().stats_by_key.values().cloned().collect();
        all.sort_by(|a, b| {
            b.last_job_at()
                .cmp(&a.last_job_at())
                .then_with(|| a.key().cmp(b.key()))
        });
        let mut page: Vec<JobStatsSnapshot> = all
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|stats| stats.calculate())
            .collect();
        page.sort_by(|a, b| a.key.cmp(&b.key));
        page
    }

    pub fn get_stats_by_key(&self, key: &str) -> Option<JobStatsSnapshot> {
        self.read()
            .stats_by_key
            .get(key)
            .map(|stats| stats.calculate())
    }

    /// 构建作业类型的排队视图
    ///
    /// 只统计调度时间落在近期窗口内的待调度请求，按优先级降序、创建时间升序排列。
    pub fn build_wait_estimate(&self, key: &str) -> JobWaitEstimate {
        self.build_wait_estimate_at(key, Utc::now())
    }

    fn build_wait_estimate_at(&self, key: &str, now: DateTime<Utc>) -> JobWaitEstimate {
        let horizon = now
            + chrono::Duration::from_std(self.wait_horizon).unwrap_or(chrono::Duration::zero());
        let state = self.read();
        let stats = state
            .stats_by_key
            .get(key)
            .map(|stats| stats.calculate())
            .unwrap_or_else(|| JobStats::new(key, "").calculate());

        let mut queued: Vec<&JobRequestInfo> = state
            .pending_by_key
            .get(key)
            .map(|pending| {
                pending
                    .values()
                    .filter(|request| request.scheduled_at <= horizon)
                    .collect()
            })
            .unwrap_or_default();
        queued.sort_by(|a, b| {
            b.job_priority
                .cmp(&a.job_priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        JobWaitEstimate {
            key: key.to_string(),
            stats,
            pending_job_ids: queued.iter().map(|request| request.id).collect(),
            job_request_id: None,
            queue_number: None,
            estimated_wait: None,
            scheduled_at: None,
            error_message: None,
        }
    }

    /// 某个请求的排队位置与预计等待时间
    ///
    /// `available_ants` 为能够承接该作业全部任务的最少Ant数量。
    pub fn wait_estimate_for(&self, request: &JobRequestInfo, available_ants: usize) -> JobWaitEstimate {
        let key = request.user_job_type_key();
        let mut estimate = self.build_wait_estimate(&key);
        estimate.job_request_id = Some(request.id);
        estimate.scheduled_at = Some(request.scheduled_at);

        if !estimate.stats.ants_available {
            estimate.error_message = estimate.stats.ant_unavailable_error.clone();
        } else if estimate.stats.job_disabled {
            estimate.error_message = Some(format!("作业 {} 已禁用", request.job_type));
        }

        if !request.job_state.is_pending() {
            estimate.error_message = Some(format!(
                "请求 {} 当前状态为 {}，不在排队中",
                request.id, request.job_state
            ));
            return estimate;
        }

        match estimate.pending_job_ids.iter().position(|id| *id == request.id) {
            Some(position) => {
                estimate.queue_number = Some(position);
                let average = Duration::from_secs_f64(estimate.stats.succeeded_latency.average);
                estimate.estimated_wait = JobWaitEstimate::estimate(
                    position,
                    estimate.stats.executing_jobs,
                    available_ants,
                    average,
                );
            }
            None => {
                estimate.error_message = Some(format!(
                    "无法估算请求 {} (作业 {}) 的排队时间",
                    request.id, request.job_type
                ));
            }
        }
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, priority: i32, created_offset_secs: i64) -> JobRequestInfo {
        let mut request = JobRequestInfo::new("build", "alice").with_priority(priority);
        request.id = id;
        request.created_at = Utc::now() - chrono::Duration::seconds(100 - created_offset_secs);
        request.scheduled_at = request.created_at;
        request
    }

    #[test]
    fn test_wait_estimate_order_priority_then_age() {
        let registry = StatsRegistry::new();
        let t1 = request(1, 5, 1);
        let t2 = request(2, 10, 2);
        let t3 = request(3, 5, 3);
        for r in [&t3, &t1, &t2] {
            registry.pending(r, false);
        }

        let estimate = registry.build_wait_estimate(&t1.user_job_type_key());
        assert_eq!(estimate.pending_job_ids, vec![2, 1, 3]);
        assert_eq!(estimate.pending_jobs(), 3);
    }

    #[test]
    fn test_wait_estimate_skips_far_future_requests() {
        let registry = StatsRegistry::new();
        let near = request(1, 5, 1);
        let mut far = request(2, 10, 2);
        far.scheduled_at = Utc::now() + chrono::Duration::minutes(10);
        registry.pending(&near, false);
        registry.pending(&far, false);

        let estimate = registry.build_wait_estimate(&near.user_job_type_key());
        assert_eq!(estimate.pending_job_ids, vec![1]);
    }

    #[test]
    fn test_unknown_key_yields_empty_estimate() {
        let registry = StatsRegistry::new();
        let estimate = registry.build_wait_estimate("nobody-nothing");
        assert!(estimate.pending_job_ids.is_empty());
        assert_eq!(estimate.stats.key, "nobody-nothing");
    }

    #[test]
    fn test_user_org_executing_tracks_lifecycle() {
        let registry = StatsRegistry::new();
        let a = request(1, 5, 1).with_organization("acme");
        let b = request(2, 5, 2).with_organization("acme");
        let mut c = request(3, 5, 3).with_organization("acme");
        c.user_id = "bob".to_string();

        registry.pending(&a, false);
        registry.started(&a);
        registry.started(&b);
        registry.started(&c);
        assert_eq!(registry.user_org_executing(&a), (2, 3));
        assert_eq!(registry.get_execution_count(&a.user_job_type_key()), 3);

        registry.succeeded(&a, Duration::from_secs(5));
        registry.cancelled(&c);
        assert_eq!(registry.user_org_executing(&a), (1, 1));
        assert_eq!(
            registry.last_job_status(&a.user_job_type_key()),
            Some(JobState::Cancelled)
        );
        assert!(registry
            .build_wait_estimate(&a.user_job_type_key())
            .pending_job_ids
            .is_empty());
    }

    #[test]
    fn test_wait_estimate_for_request() {
        let registry = StatsRegistry::new();
        let done = request(10, 5, 0);
        registry.started(&done);
        registry.succeeded(&done, Duration::from_secs(60));

        let first = request(1, 5, 1);
        let second = request(2, 5, 2);
        registry.pending(&first, false);
        registry.pending(&second, false);

        let estimate = registry.wait_estimate_for(&second, 2);
        assert_eq!(estimate.queue_number, Some(1));
        // (1 + 1 + 0) / 2 * 60s
        assert_eq!(estimate.estimated_wait, Some(Duration::from_secs(60)));
        assert!(estimate.error_message.is_none());

        let mut running = second.clone();
        running.job_state = JobState::Executing;
        assert!(registry.wait_estimate_for(&running, 2).error_message.is_some());
    }

    #[test]
    fn test_get_stats_pages_by_recent_activity() {
        let registry = StatsRegistry::new();
        let old = JobRequestInfo::new("old", "alice");
        let new = JobRequestInfo::new("new", "alice");
        registry.started(&old);
        std::thread::sleep(Duration::from_millis(5));
        registry.started(&new);

        let page = registry.get_stats(0, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].key, "alice-new");
        assert_eq!(registry.get_stats(1, 10)[0].key, "alice-old");
        assert!(registry.get_stats_by_key("alice-old").is_some());
    }
}
