//! 作业调度器
//!
//! 按固定周期执行调度轮次：健康检查 -> 拉取一批可调度的PENDING请求 ->
//! 逐个交给执行状态机。孤儿请求回收、cron补齐与领导者心跳各自独立运行，
//! 共享同一个停止信号。

mod leader;
mod sweeps;

pub use leader::{LeaderElection, LEADER_LEASE_NAME};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use scheduler_core::{HealthMonitor, SchedulerError, SchedulerResult};

use crate::execution::{JobExecutionStateMachine, ScheduleOutcome, SchedulingContext};

/// 调度器对外暴露的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_pending_jobs: u64,
    pub total_scheduled_jobs: u64,
    pub no_jobs_tries: u32,
}

/// 一轮调度的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassResult {
    /// 上一轮仍在进行，本轮被丢弃
    Busy,
    /// 调度器已隔离，不再开始新的轮次
    Cordoned,
    /// 本实例不是领导者
    NotLeader,
    /// 退避中，消耗一次退避计数
    Backoff { remaining: u32 },
    Completed {
        checked: usize,
        progressed: usize,
        scheduled: usize,
    },
}

pub struct JobScheduler {
    ctx: Arc<SchedulingContext>,
    health: Arc<dyn HealthMonitor>,
    leader: Arc<LeaderElection>,
    pass_lock: Mutex<()>,
    no_jobs_tries: AtomicU32,
    total_pending_jobs: AtomicU64,
    total_scheduled_jobs: AtomicU64,
    cordoned: AtomicBool,
    shutting_down: AtomicBool,
    tasks: Mutex<Option<(watch::Sender<bool>, Vec<JoinHandle<()>>)>>,
}

impl JobScheduler {
    pub fn new(
        ctx: Arc<SchedulingContext>,
        health: Arc<dyn HealthMonitor>,
        leader: Arc<LeaderElection>,
    ) -> Self {
        Self {
            ctx,
            health,
            leader,
            pass_lock: Mutex::new(()),
            no_jobs_tries: AtomicU32::new(0),
            total_pending_jobs: AtomicU64::new(0),
            total_scheduled_jobs: AtomicU64::new(0),
            cordoned: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<SchedulingContext> {
        &self.ctx
    }

    pub fn leader(&self) -> &Arc<LeaderElection> {
        &self.leader
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            total_pending_jobs: self.total_pending_jobs.load(Ordering::Relaxed),
            total_scheduled_jobs: self.total_scheduled_jobs.load(Ordering::Relaxed),
            no_jobs_tries: self.no_jobs_tries.load(Ordering::SeqCst),
        }
    }

    /// 停止开始新的调度轮次，已在进行的轮次不受影响
    pub fn cordon(&self) {
        if !self.cordoned.swap(true, Ordering::SeqCst) {
            info!("调度器已隔离，不再开始新的调度轮次");
        }
    }

    pub fn is_cordoned(&self) -> bool {
        self.cordoned.load(Ordering::SeqCst)
    }

    /// 启动调度、孤儿回收、cron补齐与领导者心跳循环
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(SchedulerError::Internal("调度器已经启动".to_string()));
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        let (tx, rx) = watch::channel(false);
        let jobs = &self.ctx.jobs;

        // 先尝试一次选举，避免第一轮调度空转
        if let Err(e) = self.leader.heartbeat().await {
            warn!("首次领导者选举失败: {e}");
        }

        let mut handles = Vec::new();
        let scheduler = self.clone();
        handles.push(spawn_ticker(
            "leader-heartbeat",
            jobs.leader_interval(),
            rx.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    if let Err(e) = scheduler.leader.heartbeat().await {
                        warn!("领导者心跳失败: {e}");
                    }
                }
            },
        ));

        let scheduler = self.clone();
        handles.push(spawn_ticker(
            "schedule-pass",
            jobs.check_pending_jobs_interval(),
            rx.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    match scheduler.schedule_pass().await {
                        Ok(result) => debug!(?result, "调度轮次结束"),
                        Err(SchedulerError::NoSchedulableJobs) => debug!("没有待调度的请求"),
                        Err(e) => warn!("调度轮次失败: {e}"),
                    }
                }
            },
        ));

        let scheduler = self.clone();
        handles.push(spawn_ticker(
            "orphan-sweep",
            jobs.orphan_requests_update_interval(),
            rx.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    if !scheduler.leader.is_leader() {
                        return;
                    }
                    if let Err(e) = scheduler.requeue_orphans().await {
                        warn!("回收孤儿请求失败: {e}");
                    }
                }
            },
        ));

        let scheduler = self.clone();
        handles.push(spawn_ticker(
            "missing-cron-sweep",
            jobs.missing_cron_jobs_interval(),
            rx,
            move || {
                let scheduler = scheduler.clone();
                async move {
                    if !scheduler.leader.is_leader() {
                        return;
                    }
                    if let Err(e) = scheduler.schedule_missing_cron_jobs().await {
                        warn!("补齐cron请求失败: {e}");
                    }
                }
            },
        ));

        *tasks = Some((tx, handles));
        info!(server_id = %self.leader.server_id(), "作业调度器已启动");
        Ok(())
    }

    /// 通知所有循环退出并等待它们结束，随后释放领导者租约
    pub async fn stop(&self) -> SchedulerResult<()> {
        self.cordon();
        self.shutting_down.store(true, Ordering::SeqCst);
        let running = self.tasks.lock().await.take();
        if let Some((tx, handles)) = running {
            let _ = tx.send(true);
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    warn!("调度循环异常退出: {e}");
                }
            }
        }
        self.leader.resign().await?;
        info!("作业调度器已停止");
        Ok(())
    }

    fn add_backoff(&self, tries: u32) {
        let value = self.no_jobs_tries.fetch_add(tries, Ordering::SeqCst) + tries;
        self.ctx.metrics.set_no_jobs_backoff(value);
    }

    fn set_backoff(&self, tries: u32) {
        self.no_jobs_tries.store(tries, Ordering::SeqCst);
        self.ctx.metrics.set_no_jobs_backoff(tries);
    }

    /// 执行一轮调度
    ///
    /// 轮次之间互斥；上一轮未结束时直接返回 `Busy`，不排队。
    pub async fn schedule_pass(&self) -> SchedulerResult<PassResult> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("上一轮调度尚未结束，跳过本轮");
            return Ok(PassResult::Busy);
        };
        if self.is_cordoned() && !self.shutting_down.load(Ordering::SeqCst) {
            return Ok(PassResult::Cordoned);
        }

        let tries = self.no_jobs_tries.load(Ordering::SeqCst);
        if tries > 0 {
            self.set_backoff(tries - 1);
            return Ok(PassResult::Backoff {
                remaining: tries - 1,
            });
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            self.ctx.metrics.record_shutting_down();
            return Err(SchedulerError::ShuttingDown);
        }
        if !self.leader.is_leader() {
            return Ok(PassResult::NotLeader);
        }

        let span = info_span!("schedule_pass");
        self.run_pass().instrument(span).await
    }

    async fn run_pass(&self) -> SchedulerResult<PassResult> {
        let started = Instant::now();
        let jobs = &self.ctx.jobs;

        let health = tokio::time::timeout(jobs.health_check_timeout(), self.health.health_status())
            .await
            .unwrap_or_else(|_| {
                Err(SchedulerError::Timeout(format!(
                    "健康检查超过 {:?}",
                    jobs.health_check_timeout()
                )))
            });
        if let Err(e) = health {
            self.add_backoff(2);
            self.ctx.metrics.record_bad_health();
            return Err(SchedulerError::UnhealthyDependency(e.to_string()));
        }

        let requests = match self
            .ctx
            .repositories
            .job_requests
            .next_schedulable_job_requests_by_type(&[], jobs.pending_batch_size)
            .await
        {
            Ok(requests) => requests,
            Err(e) => {
                if self.no_jobs_tries.load(Ordering::SeqCst) < jobs.max_no_jobs_tries {
                    self.add_backoff(1);
                }
                return Err(SchedulerError::BatchFetchFailure(e.to_string()));
            }
        };
        if requests.is_empty() {
            self.add_backoff(3);
            self.ctx.metrics.record_no_more_jobs();
            return Err(SchedulerError::NoSchedulableJobs);
        }

        self.ctx
            .metrics
            .set_registered_ants(self.ctx.resources.registrations().len());

        let checked = requests.len();
        let mut progressed = 0;
        let mut scheduled = 0;
        for request in requests {
            self.total_pending_jobs.fetch_add(1, Ordering::Relaxed);
            self.ctx.stats.pending(&request, false);
            self.ctx.metrics.record_checked_pending();

            let request_id = request.id;
            match JobExecutionStateMachine::new(self.ctx.clone(), request)
                .run()
                .await
            {
                Ok(outcome) => {
                    if outcome.is_progress() {
                        progressed += 1;
                    }
                    if matches!(outcome, ScheduleOutcome::Scheduled { .. }) {
                        scheduled += 1;
                        self.total_scheduled_jobs.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => warn!(request_id, "调度请求失败，下一轮重试: {e}"),
            }
        }

        if progressed == 0 {
            if self.no_jobs_tries.load(Ordering::SeqCst) < jobs.max_no_jobs_tries {
                self.add_backoff(1);
            }
        } else {
            self.set_backoff(0);
        }

        self.ctx.metrics.record_pass_duration(started.elapsed());
        info!(
            checked,
            progressed,
            scheduled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "调度轮次完成"
        );
        Ok(PassResult::Completed {
            checked,
            progressed,
            scheduled,
        })
    }
}

/// 按周期执行 `tick`，收到停止信号后退出；错过的周期直接丢弃
fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(name, ?period, "启动周期任务");
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(name, "周期任务退出");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::config::{JobsConfig, MessageQueueConfig};
    use scheduler_domain::entities::JobRequestInfo;
    use scheduler_domain::repositories::JobRequestRepository;
    use scheduler_infrastructure::{
        InMemoryMessageQueue, MemoryStores, SchedulerMetrics, StaticHealthMonitor,
    };

    use crate::resource::AntResourceManager;
    use crate::stats::StatsRegistry;

    fn scheduler(stores: &MemoryStores, health: Arc<StaticHealthMonitor>) -> JobScheduler {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let jobs = JobsConfig::default();
        let topics = MessageQueueConfig::default();
        let resources = Arc::new(AntResourceManager::new(
            "test",
            jobs.clone(),
            topics.clone(),
            queue.clone(),
        ));
        let mut no_election = jobs.clone();
        no_election.leader_election_enabled = false;
        let leader = Arc::new(LeaderElection::new(
            "test",
            &no_election,
            &topics,
            stores.leases.clone(),
            queue.clone(),
            SchedulerMetrics::new(),
        ));
        let ctx = Arc::new(SchedulingContext {
            jobs,
            topics,
            repositories: stores.repositories(),
            resources,
            stats: Arc::new(StatsRegistry::new()),
            queue,
            metrics: SchedulerMetrics::new(),
        });
        JobScheduler::new(ctx, health, leader)
    }

    #[tokio::test]
    async fn test_empty_queue_backs_off_three_passes() {
        let stores = MemoryStores::new();
        let s = scheduler(&stores, Arc::new(StaticHealthMonitor::healthy()));

        assert!(matches!(
            s.schedule_pass().await,
            Err(SchedulerError::NoSchedulableJobs)
        ));
        assert_eq!(s.stats().no_jobs_tries, 3);
        for remaining in [2, 1, 0] {
            assert_eq!(
                s.schedule_pass().await.unwrap(),
                PassResult::Backoff { remaining }
            );
        }
        assert!(s.schedule_pass().await.is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_dependency_backs_off_two_passes() {
        let stores = MemoryStores::new();
        let health = Arc::new(StaticHealthMonitor::healthy());
        health.set_healthy(false);
        let s = scheduler(&stores, health);
        stores
            .job_requests
            .save(&JobRequestInfo::new("build", "alice"))
            .await
            .unwrap();

        assert!(matches!(
            s.schedule_pass().await,
            Err(SchedulerError::UnhealthyDependency(_))
        ));
        assert_eq!(s.stats().no_jobs_tries, 2);
    }

    #[tokio::test]
    async fn test_cordoned_scheduler_starts_no_pass() {
        let stores = MemoryStores::new();
        let s = scheduler(&stores, Arc::new(StaticHealthMonitor::healthy()));
        s.cordon();
        assert_eq!(s.schedule_pass().await.unwrap(), PassResult::Cordoned);
    }

    #[tokio::test]
    async fn test_stopped_scheduler_reports_shutting_down() {
        let stores = MemoryStores::new();
        let s = scheduler(&stores, Arc::new(StaticHealthMonitor::healthy()));
        s.stop().await.unwrap();
        assert!(matches!(
            s.schedule_pass().await,
            Err(SchedulerError::ShuttingDown)
        ));
    }
}
