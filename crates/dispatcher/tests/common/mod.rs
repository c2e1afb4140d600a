#![allow(dead_code)]

use std::sync::Arc;

use scheduler_core::config::{JobsConfig, MessageQueueConfig};
use scheduler_core::HealthMonitor;
use scheduler_dispatcher::{
    AntResourceManager, JobExecutionStateMachine, JobScheduler, LeaderElection, ResourceManager,
    SchedulingContext, StatsRegistry,
};
use scheduler_domain::entities::{AntRegistration, JobDefinition, JobRequestInfo, TaskDefinition};
use scheduler_domain::repositories::JobRequestRepository;
use scheduler_infrastructure::{
    InMemoryMessageQueue, MemoryStores, SchedulerMetrics, StaticHealthMonitor,
};

pub const LAUNCH_TOPIC: &str = "job-execution-launch";

/// 进程内的完整调度环境
pub struct Harness {
    pub stores: MemoryStores,
    pub queue: Arc<InMemoryMessageQueue>,
    pub resources: Arc<AntResourceManager>,
    pub stats: Arc<StatsRegistry>,
    pub health: Arc<StaticHealthMonitor>,
    pub ctx: Arc<SchedulingContext>,
    pub scheduler: Arc<JobScheduler>,
}

impl Harness {
    pub fn new() -> Self {
        let jobs = JobsConfig {
            leader_election_enabled: false,
            ..JobsConfig::default()
        };
        Self::with_jobs(jobs)
    }

    pub fn with_jobs(jobs: JobsConfig) -> Self {
        Self::build("scheduler-test", jobs, MemoryStores::new(), Arc::new(InMemoryMessageQueue::new()))
    }

    /// 调度器使用给定的健康监控，`health` 字段不再参与调度
    pub fn with_health_monitor(jobs: JobsConfig, monitor: Arc<dyn HealthMonitor>) -> Self {
        Self::assemble(
            "scheduler-test",
            jobs,
            MemoryStores::new(),
            Arc::new(InMemoryMessageQueue::new()),
            Some(monitor),
        )
    }

    /// 与其他实例共享存储和总线，用于多实例场景
    pub fn build(
        server_id: &str,
        jobs: JobsConfig,
        stores: MemoryStores,
        queue: Arc<InMemoryMessageQueue>,
    ) -> Self {
        Self::assemble(server_id, jobs, stores, queue, None)
    }

    fn assemble(
        server_id: &str,
        jobs: JobsConfig,
        stores: MemoryStores,
        queue: Arc<InMemoryMessageQueue>,
        monitor: Option<Arc<dyn HealthMonitor>>,
    ) -> Self {
        let topics = MessageQueueConfig::default();
        let metrics = SchedulerMetrics::new();
        let resources = Arc::new(AntResourceManager::new(
            server_id,
            jobs.clone(),
            topics.clone(),
            queue.clone(),
        ));
        let stats = Arc::new(StatsRegistry::with_wait_horizon(
            jobs.wait_estimate_horizon(),
        ));
        let health = Arc::new(StaticHealthMonitor::healthy());
        let leader = Arc::new(LeaderElection::new(
            server_id,
            &jobs,
            &topics,
            stores.leases.clone(),
            queue.clone(),
            metrics.clone(),
        ));
        let ctx = Arc::new(SchedulingContext {
            jobs,
            topics,
            repositories: stores.repositories(),
            resources: resources.clone(),
            stats: stats.clone(),
            queue: queue.clone(),
            metrics,
        });
        let monitor = monitor.unwrap_or_else(|| health.clone() as Arc<dyn HealthMonitor>);
        let scheduler = Arc::new(JobScheduler::new(ctx.clone(), monitor, leader));
        Self {
            stores,
            queue,
            resources,
            stats,
            health,
            ctx,
            scheduler,
        }
    }

    pub fn register_ant(&self, ant_id: &str, methods: &[&str], capacity: i32) {
        self.resources
            .register(AntRegistration::new(ant_id, methods, capacity))
            .expect("注册Ant");
    }

    pub async fn submit(&self, definition: &JobDefinition) -> JobRequestInfo {
        self.stores.job_definitions.insert(definition.clone()).await;
        let request = JobRequestInfo::new(definition.job_type.clone(), definition.user_id.clone())
            .with_definition(definition)
            .with_priority(definition.priority);
        self.stores.job_requests.save(&request).await.expect("保存请求")
    }

    pub async fn request(&self, id: u64) -> JobRequestInfo {
        self.stores.job_requests.get(id).await.expect("读取请求")
    }

    pub fn state_machine(&self, request: JobRequestInfo) -> JobExecutionStateMachine {
        JobExecutionStateMachine::new(self.ctx.clone(), request)
    }
}

pub fn shell_job(job_type: &str) -> JobDefinition {
    JobDefinition::new(format!("def-{job_type}"), job_type, "alice")
        .with_task(TaskDefinition::new("compile", "SHELL"))
        .with_task(TaskDefinition::new("package", "SHELL"))
}
