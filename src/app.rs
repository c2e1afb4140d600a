use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use scheduler_core::config::{AppConfig, MessageQueueKind};
use scheduler_core::{MessageQueue, SchedulerError};
use scheduler_dispatcher::{
    AntResourceManager, JobLifecycleListener, JobScheduler, LeaderElection, SchedulingContext,
    StatsRegistry,
};
use scheduler_infrastructure::{
    DatabaseManager, DependencyHealthMonitor, InMemoryMessageQueue, RabbitMqMessageQueue,
    SchedulerMetrics,
};

/// 调度服务的全部组件
pub struct Application {
    config: AppConfig,
    database: Arc<DatabaseManager>,
    queue: Arc<dyn MessageQueue>,
    resources: Arc<AntResourceManager>,
    scheduler: Arc<JobScheduler>,
    listener: Arc<JobLifecycleListener>,
}

impl Application {
    /// 按配置连接存储和消息总线并组装调度器，此时还未启动任何后台任务
    pub async fn new(config: AppConfig) -> Result<Self> {
        let database = Arc::new(
            DatabaseManager::new(&config.database)
                .await
                .context("初始化数据库失败")?,
        );

        let mut rabbit = None;
        let queue: Arc<dyn MessageQueue> = match config.message_queue.kind {
            MessageQueueKind::InMemory => {
                info!("使用进程内消息总线");
                Arc::new(InMemoryMessageQueue::new())
            }
            MessageQueueKind::Rabbitmq => {
                let connected = Arc::new(
                    RabbitMqMessageQueue::new(config.message_queue.clone())
                        .await
                        .context("连接RabbitMQ失败")?,
                );
                rabbit = Some(connected.clone());
                connected
            }
        };

        let health = {
            let database = database.clone();
            let mut monitor = DependencyHealthMonitor::new(config.jobs.health_check_timeout())
                .with_check("database", move || {
                    let database = database.clone();
                    async move { database.health_check().await }.boxed()
                });
            if let Some(rabbit) = rabbit {
                monitor = monitor.with_check("message_queue", move || {
                    let connected = rabbit.is_connected();
                    async move {
                        if connected {
                            Ok(())
                        } else {
                            Err(SchedulerError::MessageQueue("RabbitMQ连接已断开".to_string()))
                        }
                    }
                    .boxed()
                });
            }
            Arc::new(monitor)
        };

        let repositories = database.repositories();
        let metrics = SchedulerMetrics::new();
        let resources = Arc::new(AntResourceManager::new(
            config.server_id.clone(),
            config.jobs.clone(),
            config.message_queue.clone(),
            queue.clone(),
        ));
        let stats = Arc::new(StatsRegistry::with_wait_horizon(
            config.jobs.wait_estimate_horizon(),
        ));
        let leader = Arc::new(LeaderElection::new(
            config.server_id.clone(),
            &config.jobs,
            &config.message_queue,
            repositories.leases.clone(),
            queue.clone(),
            metrics.clone(),
        ));
        let listener = Arc::new(JobLifecycleListener::new(
            &config.message_queue,
            queue.clone(),
            stats.clone(),
            repositories.job_requests.clone(),
        ));
        let ctx = Arc::new(SchedulingContext {
            jobs: config.jobs.clone(),
            topics: config.message_queue.clone(),
            repositories,
            resources: resources.clone(),
            stats,
            queue: queue.clone(),
            metrics,
        });
        let scheduler = Arc::new(JobScheduler::new(ctx, health, leader));

        Ok(Self {
            config,
            database,
            queue,
            resources,
            scheduler,
            listener,
        })
    }

    /// 启动全部组件并阻塞到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            server_id = %self.config.server_id,
            database = ?self.database.kind(),
            message_queue = ?self.config.message_queue.kind,
            "启动作业调度服务"
        );

        self.resources.start().await.context("启动Ant资源管理器失败")?;
        self.listener.start().await.context("启动作业生命周期监听器失败")?;
        self.scheduler.start().await.context("启动调度器失败")?;
        info!("作业调度服务已启动");

        let _ = shutdown_rx.recv().await;
        self.shutdown().await;
        Ok(())
    }

    /// 先停止调度再释放外部连接，单个组件失败不影响后续组件
    pub async fn shutdown(&self) {
        info!("开始关闭作业调度服务");
        self.scheduler.cordon();

        if let Err(e) = self.scheduler.stop().await {
            warn!("停止调度器时出错: {e}");
        }
        if let Err(e) = self.listener.stop().await {
            warn!("停止作业生命周期监听器时出错: {e}");
        }
        if let Err(e) = self.resources.stop().await {
            warn!("停止Ant资源管理器时出错: {e}");
        }
        if let Err(e) = self.queue.close().await {
            error!("关闭消息总线失败: {e}");
        }
        self.database.close().await;

        let stats = self.scheduler.stats();
        info!(
            total_scheduled_jobs = stats.total_scheduled_jobs,
            total_pending_jobs = stats.total_pending_jobs,
            "作业调度服务已关闭"
        );
    }
}
