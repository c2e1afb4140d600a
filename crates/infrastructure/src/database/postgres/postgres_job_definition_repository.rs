use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{JobDefinition, JobTypeCronTrigger},
    repositories::JobDefinitionRepository,
};

const SELECT_COLUMNS: &str = "id, job_type, sem_version, user_id, organization_id, cron_trigger, \
     max_concurrency, priority, disabled, paused, tags, tasks, filters, variables";

pub struct PostgresJobDefinitionRepository {
    pool: PgPool,
}

impl PostgresJobDefinitionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_definition(row: &sqlx::postgres::PgRow) -> SchedulerResult<JobDefinition> {
        let Json(tags) = row.try_get("tags")?;
        let Json(tasks) = row.try_get("tasks")?;
        let Json(filters) = row.try_get("filters")?;
        let Json(variables) = row.try_get("variables")?;
        Ok(JobDefinition {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            sem_version: row.try_get("sem_version")?,
            user_id: row.try_get("user_id")?,
            organization_id: row.try_get("organization_id")?,
            cron_trigger: row.try_get("cron_trigger")?,
            max_concurrency: row.try_get::<i32, _>("max_concurrency")?.max(0) as u32,
            priority: row.try_get("priority")?,
            disabled: row.try_get("disabled")?,
            paused: row.try_get("paused")?,
            tags,
            tasks,
            filters,
            variables,
        })
    }

    /// 新增或覆盖作业定义
    pub async fn upsert(&self, definition: &JobDefinition) -> SchedulerResult<()> {
        definition.validate()?;
        sqlx::query(
            r#"
            INSERT INTO job_definitions (id, job_type, sem_version, user_id, organization_id, cron_trigger,
                max_concurrency, priority, disabled, paused, tags, tasks, filters, variables)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET job_type = EXCLUDED.job_type, sem_version = EXCLUDED.sem_version,
                user_id = EXCLUDED.user_id, organization_id = EXCLUDED.organization_id,
                cron_trigger = EXCLUDED.cron_trigger, max_concurrency = EXCLUDED.max_concurrency,
                priority = EXCLUDED.priority, disabled = EXCLUDED.disabled, paused = EXCLUDED.paused,
                tags = EXCLUDED.tags, tasks = EXCLUDED.tasks, filters = EXCLUDED.filters,
                variables = EXCLUDED.variables
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.job_type)
        .bind(&definition.sem_version)
        .bind(&definition.user_id)
        .bind(&definition.organization_id)
        .bind(&definition.cron_trigger)
        .bind(definition.max_concurrency as i32)
        .bind(definition.priority)
        .bind(definition.disabled)
        .bind(definition.paused)
        .bind(Json(&definition.tags))
        .bind(Json(&definition.tasks))
        .bind(Json(&definition.filters))
        .bind(Json(&definition.variables))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl JobDefinitionRepository for PostgresJobDefinitionRepository {
    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> SchedulerResult<JobDefinition> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM job_definitions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::JobDefinitionNotFound { id: id.to_string() })?;
        Self::row_to_definition(&row)
    }

    #[instrument(skip(self))]
    async fn get_by_type(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        job_type: &str,
    ) -> SchedulerResult<JobDefinition> {
        // 组织内共享定义优先于个人定义
        let row = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM job_definitions
            WHERE job_type = $1 AND (user_id = $2 OR ($3::text IS NOT NULL AND organization_id = $3))
            ORDER BY (organization_id IS NOT DISTINCT FROM $3) DESC, id
            LIMIT 1
            "#
        ))
        .bind(job_type)
        .bind(user_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::JobDefinitionNotFound {
            id: job_type.to_string(),
        })?;
        Self::row_to_definition(&row)
    }

    async fn get_cron_triggered_job_types(&self) -> SchedulerResult<Vec<JobTypeCronTrigger>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, organization_id, job_type, cron_trigger FROM job_definitions
            WHERE cron_trigger IS NOT NULL AND cron_trigger <> '' AND NOT disabled
            ORDER BY job_type, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(JobTypeCronTrigger {
                    user_id: row.try_get("user_id")?,
                    organization_id: row.try_get("organization_id")?,
                    job_type: row.try_get("job_type")?,
                    cron_trigger: row.try_get("cron_trigger")?,
                })
            })
            .collect()
    }
}
