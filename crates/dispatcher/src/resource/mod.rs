//! Ant资源管理
//!
//! 跟踪Ant注册（容量、标签、执行方式）、容器生命周期，并为作业请求预留/释放容量。

mod reaper;
mod state;
mod subscription;

pub use state::ContainerSort;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scheduler_core::{
    config::{JobsConfig, MessageQueueConfig},
    MessageQueue, SchedulerError, SchedulerResult,
};
use scheduler_domain::{
    entities::{AntRegistration, AntReservation, ContainerLifecycleEvent, JobDefinition},
    events::{ContainerAction, ContainerControlCommand, DomainEvent},
};

use state::ResourceState;

/// 调度核心使用的资源管理接口
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// 注册或刷新一个Ant
    fn register(&self, registration: AntRegistration) -> SchedulerResult<()>;

    fn remove_registration(&self, ant_id: &str) -> Option<AntRegistration>;

    fn registrations(&self) -> Vec<AntRegistration>;

    fn registration(&self, ant_id: &str) -> Option<AntRegistration>;

    /// 每种执行方式、每个标签是否都有可用的Ant
    fn has_ants_for_job_tags(&self, methods: &[String], tags: &[String]) -> SchedulerResult<()>;

    /// 试算作业的资源分配，不做任何预留
    fn check_job_resources(&self, definition: &JobDefinition) -> SchedulerResult<Vec<AntReservation>>;

    /// 能同时承接作业全部任务的最少Ant数
    fn available_ants_for_job(&self, definition: &JobDefinition) -> usize;

    /// 全有或全无地预留资源；请求已持有预留时返回 `AlreadyScheduled`
    fn reserve_job_resources(
        &self,
        request_id: u64,
        definition: &JobDefinition,
    ) -> SchedulerResult<Vec<AntReservation>>;

    fn release(&self, reservation: &AntReservation) -> SchedulerResult<()>;

    /// 释放请求的全部预留，返回释放的数量
    fn release_job_resources(&self, request_id: u64) -> usize;

    fn reservations_for(&self, request_id: u64) -> Vec<AntReservation>;

    /// 分页列出全部预留，同时返回总数
    fn reservations(&self, offset: usize, limit: usize) -> (Vec<AntReservation>, usize);

    fn update_container(&self, event: ContainerLifecycleEvent);

    fn get_container_events(
        &self,
        offset: usize,
        limit: usize,
        sort: ContainerSort,
    ) -> (Vec<ContainerLifecycleEvent>, usize);

    /// 按执行方式统计运行中的容器
    fn count_container_events(&self) -> HashMap<String, usize>;

    /// 通知Ant终止容器，只是建议性的
    async fn terminate_container(
        &self,
        container_id: &str,
        ant_id: &str,
        method: &str,
    ) -> SchedulerResult<()>;
}

/// 基于内存索引的资源管理器
pub struct AntResourceManager {
    id: String,
    jobs: JobsConfig,
    topics: MessageQueueConfig,
    queue: Arc<dyn MessageQueue>,
    state: RwLock<ResourceState>,
    subscriptions: Mutex<Vec<(String, String)>>,
    reaper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl AntResourceManager {
    pub fn new(
        id: impl Into<String>,
        jobs: JobsConfig,
        topics: MessageQueueConfig,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        let state = ResourceState::new(
            jobs.ant_registration_alive_timeout(),
            jobs.container_event_log_capacity,
        );
        Self {
            id: id.into(),
            jobs,
            topics,
            queue,
            state: RwLock::new(state),
            subscriptions: Mutex::new(Vec::new()),
            reaper: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ResourceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ResourceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 订阅注册、容器、作业与任务生命周期主题，并启动回收器
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        let handlers = subscription::handlers(self);
        for (topic, handler) in handlers {
            match self
                .queue
                .subscribe(&topic, scheduler_core::SubscribeOptions::shared(), handler)
                .await
            {
                Ok(id) => self.subscriptions.lock().await.push((topic, id)),
                Err(e) => {
                    warn!(topic = %topic, "资源管理器订阅失败: {e}");
                    let _ = self.stop().await;
                    return Err(e);
                }
            }
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper::run(self.clone(), rx));
        *self.reaper.lock().await = Some((tx, handle));

        info!(manager_id = %self.id, "资源管理器已启动");
        Ok(())
    }

    pub async fn stop(&self) -> SchedulerResult<()> {
        if let Some((tx, handle)) = self.reaper.lock().await.take() {
            let _ = tx.send(true);
            let _ = handle.await;
        }

        let mut first_error = None;
        for (topic, id) in self.subscriptions.lock().await.drain(..) {
            if let Err(e) = self.queue.unsubscribe(&topic, &id).await {
                warn!(topic = %topic, "取消订阅失败: {e}");
                first_error.get_or_insert(e);
            }
        }
        info!(manager_id = %self.id, "资源管理器已停止");
        first_error.map_or(Ok(()), Err)
    }

    /// 回收过期的Ant注册与超时的预留，返回 (Ant数, 分配数)
    pub fn reap(&self) -> (usize, usize) {
        let now = Utc::now();
        let mut state = self.write();
        let stale_ants = state.reap_stale_registrations(now);
        let stale_allocations =
            state.reap_stale_allocations(self.jobs.ant_reservation_timeout(), now);
        drop(state);
        for ant_id in &stale_ants {
            info!(ant_id = %ant_id, "Ant心跳超时，已移除注册");
        }
        (stale_ants.len(), stale_allocations)
    }

    /// 最近收到的容器事件，新的在前
    pub fn recent_container_events(&self, limit: usize) -> Vec<ContainerLifecycleEvent> {
        self.read().recent_container_events(limit)
    }

    pub(crate) fn jobs_config(&self) -> &JobsConfig {
        &self.jobs
    }

    pub(crate) fn topics(&self) -> &MessageQueueConfig {
        &self.topics
    }
}

#[async_trait]
impl ResourceManager for AntResourceManager {
    fn register(&self, registration: AntRegistration) -> SchedulerResult<()> {
        let ant_id = registration.ant_id.clone();
        let capacity = registration.max_capacity;
        let is_new = self.write().add_registration(registration, Utc::now())?;
        if is_new {
            info!(ant_id = %ant_id, capacity, "新的Ant已注册");
        } else {
            debug!(ant_id = %ant_id, "收到Ant心跳");
        }
        Ok(())
    }

    fn remove_registration(&self, ant_id: &str) -> Option<AntRegistration> {
        let removed = self.write().remove_registration(ant_id);
        if removed.is_some() {
            info!(ant_id = %ant_id, "已移除Ant注册");
        }
        removed
    }

    fn registrations(&self) -> Vec<AntRegistration> {
        self.read().registrations()
    }

    fn registration(&self, ant_id: &str) -> Option<AntRegistration> {
        self.read().registration(ant_id)
    }

    fn has_ants_for_job_tags(&self, methods: &[String], tags: &[String]) -> SchedulerResult<()> {
        self.read().has_ants_for_job_tags(methods, tags, Utc::now())
    }

    fn check_job_resources(&self, definition: &JobDefinition) -> SchedulerResult<Vec<AntReservation>> {
        self.read().check_job_resources(definition, Utc::now())
    }

    fn available_ants_for_job(&self, definition: &JobDefinition) -> usize {
        self.read().available_ants_for_job(definition, Utc::now())
    }

    fn reserve_job_resources(
        &self,
        request_id: u64,
        definition: &JobDefinition,
    ) -> SchedulerResult<Vec<AntReservation>> {
        let reservations = self
            .write()
            .reserve_job_resources(request_id, definition, Utc::now())?;
        debug!(
            request_id,
            ants = ?reservations.iter().map(|r| r.ant_id.as_str()).collect::<Vec<_>>(),
            "已为请求预留资源"
        );
        Ok(reservations)
    }

    fn release(&self, reservation: &AntReservation) -> SchedulerResult<()> {
        let result = self.write().release(reservation);
        if let Err(e) = &result {
            warn!(
                request_id = reservation.job_request_id,
                task_type = %reservation.task_type,
                ant_id = %reservation.ant_id,
                "释放任务预留时出错: {e}"
            );
        }
        result
    }

    fn release_job_resources(&self, request_id: u64) -> usize {
        let released = self.write().release_job(request_id);
        if released > 0 {
            debug!(request_id, released, "已释放请求的全部预留");
        }
        released
    }

    fn reservations_for(&self, request_id: u64) -> Vec<AntReservation> {
        self.read().reservations_for(request_id)
    }

    fn reservations(&self, offset: usize, limit: usize) -> (Vec<AntReservation>, usize) {
        let all = self.read().all_reservations();
        let total = all.len();
        (all.into_iter().skip(offset).take(limit).collect(), total)
    }

    fn update_container(&self, event: ContainerLifecycleEvent) {
        self.write().update_container(event);
    }

    fn get_container_events(
        &self,
        offset: usize,
        limit: usize,
        sort: ContainerSort,
    ) -> (Vec<ContainerLifecycleEvent>, usize) {
        let all = self.read().containers(sort, Utc::now());
        let total = all.len();
        (all.into_iter().skip(offset).take(limit).collect(), total)
    }

    fn count_container_events(&self) -> HashMap<String, usize> {
        self.read().count_containers()
    }

    async fn terminate_container(
        &self,
        container_id: &str,
        ant_id: &str,
        method: &str,
    ) -> SchedulerResult<()> {
        if self.registration(ant_id).is_none() {
            return Err(SchedulerError::AntNotFound {
                id: ant_id.to_string(),
            });
        }
        let command = ContainerControlCommand {
            action: ContainerAction::Terminate,
            ant_id: ant_id.to_string(),
            method: method.to_string(),
            container_id: container_id.to_string(),
            created_at: Utc::now(),
        };
        let topic = self.topics.ant_control_topic(ant_id);
        if let Err(e) = self
            .queue
            .publish(&topic, &command.headers(), &command.to_payload()?)
            .await
        {
            warn!(
                container_id = %container_id,
                ant_id = %ant_id,
                "发送终止容器命令失败: {e}"
            );
            return Err(SchedulerError::PublishFailure(e.to_string()));
        }
        info!(container_id = %container_id, ant_id = %ant_id, "已请求终止容器");
        Ok(())
    }
}
