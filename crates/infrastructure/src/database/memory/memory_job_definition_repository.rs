use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{JobDefinition, JobTypeCronTrigger},
    repositories::JobDefinitionRepository,
};

/// 内存作业定义仓储
#[derive(Debug, Default)]
pub struct MemoryJobDefinitionRepository {
    definitions: RwLock<HashMap<String, JobDefinition>>,
}

impl MemoryJobDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, definition: JobDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
    }
}

#[async_trait]
impl JobDefinitionRepository for MemoryJobDefinitionRepository {
    async fn get(&self, id: &str) -> SchedulerResult<JobDefinition> {
        self.definitions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobDefinitionNotFound { id: id.to_string() })
    }

    async fn get_by_type(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        job_type: &str,
    ) -> SchedulerResult<JobDefinition> {
        let definitions = self.definitions.read().await;
        definitions
            .values()
            .find(|d| {
                d.job_type == job_type
                    && match (organization_id, d.organization_id.as_deref()) {
                        (Some(org), Some(def_org)) if !org.is_empty() => org == def_org,
                        _ => d.user_id == user_id,
                    }
            })
            .cloned()
            .ok_or_else(|| SchedulerError::JobDefinitionNotFound {
                id: job_type.to_string(),
            })
    }

    async fn get_cron_triggered_job_types(&self) -> SchedulerResult<Vec<JobTypeCronTrigger>> {
        let definitions = self.definitions.read().await;
        let mut triggers: Vec<JobTypeCronTrigger> = definitions
            .values()
            .filter(|d| !d.disabled && !d.paused)
            .filter_map(|d| {
                d.cron_trigger.as_ref().map(|cron| JobTypeCronTrigger {
                    user_id: d.user_id.clone(),
                    organization_id: d.organization_id.clone(),
                    job_type: d.job_type.clone(),
                    cron_trigger: cron.clone(),
                })
            })
            .collect();
        triggers.sort_by(|a, b| a.job_type.cmp(&b.job_type).then(a.user_id.cmp(&b.user_id)));
        Ok(triggers)
    }
}
