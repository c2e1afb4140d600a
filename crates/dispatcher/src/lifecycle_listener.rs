//! 作业生命周期事件监听
//!
//! 把Ant侧上报的作业结束、暂停、取消事件折算进 `StatsRegistry`。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use scheduler_core::{
    config::MessageQueueConfig, MessageHandler, MessageQueue, QueueMessage, SchedulerResult,
    SubscribeOptions,
};
use scheduler_domain::{
    entities::{JobRequestInfo, JobState},
    events::JobExecutionLifecycleEvent,
    repositories::JobRequestRepository,
};

use crate::stats::StatsRegistry;

pub struct JobLifecycleListener {
    topic: String,
    queue: Arc<dyn MessageQueue>,
    stats: Arc<StatsRegistry>,
    job_requests: Arc<dyn JobRequestRepository>,
    subscription: Mutex<Option<String>>,
}

impl JobLifecycleListener {
    pub fn new(
        topics: &MessageQueueConfig,
        queue: Arc<dyn MessageQueue>,
        stats: Arc<StatsRegistry>,
        job_requests: Arc<dyn JobRequestRepository>,
    ) -> Self {
        Self {
            topic: topics.job_lifecycle_topic.clone(),
            queue,
            stats,
            job_requests,
            subscription: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Ok(());
        }
        let id = self
            .queue
            .subscribe(
                &self.topic,
                SubscribeOptions::shared(),
                Arc::new(Handler(self.clone())),
            )
            .await?;
        *subscription = Some(id);
        info!(topic = %self.topic, "作业生命周期监听已启动");
        Ok(())
    }

    pub async fn stop(&self) -> SchedulerResult<()> {
        if let Some(id) = self.subscription.lock().await.take() {
            self.queue.unsubscribe(&self.topic, &id).await?;
        }
        Ok(())
    }

    /// 请求已被删除时用事件里的信息还原统计所需的字段
    async fn request_for(&self, event: &JobExecutionLifecycleEvent) -> JobRequestInfo {
        match self.job_requests.get(event.job_request_id).await {
            Ok(request) => request,
            Err(e) => {
                debug!(request_id = event.job_request_id, "读取作业请求失败，使用事件内容: {e}");
                let mut request = JobRequestInfo::new(event.job_type.clone(), event.user_id.clone());
                request.id = event.job_request_id;
                request.job_version = event.job_version.clone();
                request.organization_id = event.organization_id.clone();
                request.job_state = event.job_state;
                request
            }
        }
    }

    pub async fn apply(&self, event: &JobExecutionLifecycleEvent) {
        if !(event.job_state.is_terminal() || event.job_state == JobState::Paused) {
            debug!(request_id = event.job_request_id, state = %event.job_state, "忽略非结束状态");
            return;
        }

        let request = self.request_for(event).await;
        let since = event.started_at.unwrap_or(request.created_at);
        let latency = (Utc::now() - since).to_std().unwrap_or(Duration::ZERO);

        match event.job_state {
            JobState::Completed => self.stats.succeeded(&request, latency),
            JobState::Failed => self.stats.failed(&request, latency),
            JobState::Paused => self.stats.paused(&request, latency),
            JobState::Cancelled => self.stats.cancelled(&request),
            other => warn!(state = %other, "未处理的作业状态"),
        }
        debug!(
            request_id = event.job_request_id,
            state = %event.job_state,
            latency_ms = latency.as_millis() as u64,
            "已更新作业统计"
        );
    }
}

struct Handler(Arc<JobLifecycleListener>);

#[async_trait]
impl MessageHandler for Handler {
    async fn handle(&self, message: QueueMessage) -> SchedulerResult<()> {
        let event: JobExecutionLifecycleEvent = message.decode()?;
        self.0.apply(&event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::events::DomainEvent;
    use scheduler_infrastructure::{InMemoryMessageQueue, MemoryStores};

    fn event(request: &JobRequestInfo, state: JobState) -> JobExecutionLifecycleEvent {
        JobExecutionLifecycleEvent {
            job_request_id: request.id,
            job_execution_id: "exec-1".to_string(),
            job_type: request.job_type.clone(),
            job_version: request.job_version.clone(),
            user_id: request.user_id.clone(),
            organization_id: request.organization_id.clone(),
            job_state: state,
            started_at: Some(Utc::now() - chrono::Duration::seconds(4)),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_completed_event_updates_stats() {
        let stores = MemoryStores::new();
        let queue = Arc::new(InMemoryMessageQueue::new());
        let stats = Arc::new(StatsRegistry::new());
        let topics = MessageQueueConfig::default();
        let listener = Arc::new(JobLifecycleListener::new(
            &topics,
            queue.clone(),
            stats.clone(),
            stores.job_requests.clone(),
        ));
        listener.start().await.unwrap();

        let request = stores
            .job_requests
            .save(&JobRequestInfo::new("build", "alice"))
            .await
            .unwrap();
        stats.started(&request);
        assert_eq!(stats.get_execution_count("alice-build"), 1);

        let done = event(&request, JobState::Completed);
        queue
            .publish(&topics.job_lifecycle_topic, &done.headers(), &done.to_payload().unwrap())
            .await
            .unwrap();

        let snapshot = stats.get_stats_by_key("alice-build").unwrap();
        assert_eq!(snapshot.succeeded_jobs, 1);
        assert_eq!(snapshot.executing_jobs, 0);
        assert_eq!(stats.last_job_status("alice-build"), Some(JobState::Completed));
        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_request_falls_back_to_event() {
        let stores = MemoryStores::new();
        let stats = Arc::new(StatsRegistry::new());
        let listener = JobLifecycleListener::new(
            &MessageQueueConfig::default(),
            Arc::new(InMemoryMessageQueue::new()),
            stats.clone(),
            stores.job_requests.clone(),
        );
        let mut request = JobRequestInfo::new("report", "bob");
        request.id = 99;

        listener.apply(&event(&request, JobState::Failed)).await;
        assert_eq!(stats.get_stats_by_key("bob-report").unwrap().failed_jobs, 1);
    }
}
