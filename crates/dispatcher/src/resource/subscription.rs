use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use scheduler_core::{MessageHandler, QueueMessage, SchedulerResult};
use scheduler_domain::{
    entities::{AntRegistration, ContainerLifecycleEvent, JobState},
    events::{JobExecutionLifecycleEvent, TaskExecutionLifecycleEvent},
};

use super::{AntResourceManager, ResourceManager};

/// 资源管理器订阅的全部主题及其处理器
pub(super) fn handlers(
    manager: &Arc<AntResourceManager>,
) -> Vec<(String, Arc<dyn MessageHandler>)> {
    let topics = manager.topics();
    vec![
        (
            topics.registration_topic.clone(),
            Arc::new(RegistrationHandler(manager.clone())) as Arc<dyn MessageHandler>,
        ),
        (
            topics.container_lifecycle_topic.clone(),
            Arc::new(ContainerHandler(manager.clone())),
        ),
        (
            topics.job_lifecycle_topic.clone(),
            Arc::new(JobLifecycleHandler(manager.clone())),
        ),
        (
            topics.task_lifecycle_topic.clone(),
            Arc::new(TaskLifecycleHandler(manager.clone())),
        ),
    ]
}

fn releases_resources(state: JobState) -> bool {
    state.is_terminal() || state == JobState::Paused
}

struct RegistrationHandler(Arc<AntResourceManager>);

#[async_trait]
impl MessageHandler for RegistrationHandler {
    async fn handle(&self, message: QueueMessage) -> SchedulerResult<()> {
        let registration: AntRegistration = message.decode()?;
        self.0.register(registration)
    }
}

struct ContainerHandler(Arc<AntResourceManager>);

#[async_trait]
impl MessageHandler for ContainerHandler {
    async fn handle(&self, message: QueueMessage) -> SchedulerResult<()> {
        let event: ContainerLifecycleEvent = message.decode()?;
        debug!(
            ant_id = %event.ant_id,
            container = %event.container_name,
            state = ?event.container_state,
            "收到容器生命周期事件"
        );
        self.0.update_container(event);
        Ok(())
    }
}

struct JobLifecycleHandler(Arc<AntResourceManager>);

#[async_trait]
impl MessageHandler for JobLifecycleHandler {
    async fn handle(&self, message: QueueMessage) -> SchedulerResult<()> {
        let event: JobExecutionLifecycleEvent = message.decode()?;
        if releases_resources(event.job_state) {
            self.0.release_job_resources(event.job_request_id);
        }
        Ok(())
    }
}

struct TaskLifecycleHandler(Arc<AntResourceManager>);

#[async_trait]
impl MessageHandler for TaskLifecycleHandler {
    async fn handle(&self, message: QueueMessage) -> SchedulerResult<()> {
        let event: TaskExecutionLifecycleEvent = message.decode()?;
        if !releases_resources(event.task_state) {
            return Ok(());
        }
        let reservation = self
            .0
            .reservations_for(event.job_request_id)
            .into_iter()
            .find(|r| r.task_type == event.task_type);
        match reservation {
            Some(reservation) => {
                // Ant可能已下线，预留照样被清除
                let _ = self.0.release(&reservation);
            }
            None => warn!(
                request_id = event.job_request_id,
                task_type = %event.task_type,
                "任务结束但没有找到对应的预留"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::Utc;
    use scheduler_core::{config::{JobsConfig, MessageQueueConfig}, MessageQueue};
    use scheduler_domain::entities::{JobDefinition, TaskDefinition};
    use scheduler_domain::events::DomainEvent;
    use scheduler_infrastructure::InMemoryMessageQueue;

    #[tokio::test]
    async fn test_lifecycle_events_release_reservations() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let topics = MessageQueueConfig::default();
        let manager = Arc::new(AntResourceManager::new(
            "test",
            JobsConfig::default(),
            topics.clone(),
            queue.clone(),
        ));
        manager.start().await.unwrap();
        manager
            .register(AntRegistration::new("ant-1", &["SHELL"], 4))
            .unwrap();
        let def = JobDefinition::new("d", "build", "alice")
            .with_task(TaskDefinition::new("compile", "SHELL"))
            .with_task(TaskDefinition::new("test", "SHELL"));
        manager.reserve_job_resources(5, &def).unwrap();

        let task_done = TaskExecutionLifecycleEvent {
            job_request_id: 5,
            job_execution_id: "e".to_string(),
            task_type: "compile".to_string(),
            ant_id: "ant-1".to_string(),
            task_state: JobState::Completed,
            created_at: Utc::now(),
        };
        queue
            .publish(&topics.task_lifecycle_topic, &task_done.headers(), &task_done.to_payload().unwrap())
            .await
            .unwrap();
        assert_eq!(manager.reservations_for(5).len(), 1);

        let job_done = JobExecutionLifecycleEvent {
            job_request_id: 5,
            job_execution_id: "e".to_string(),
            job_type: "build".to_string(),
            job_version: String::new(),
            user_id: "alice".to_string(),
            organization_id: None,
            job_state: JobState::Failed,
            started_at: None,
            created_at: Utc::now(),
        };
        queue
            .publish(&topics.job_lifecycle_topic, &HashMap::new(), &job_done.to_payload().unwrap())
            .await
            .unwrap();
        assert!(manager.reservations_for(5).is_empty());

        manager.stop().await.unwrap();
    }
}
