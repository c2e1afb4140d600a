use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{JobExecution, JobState},
    repositories::JobExecutionRepository,
};

const SELECT_COLUMNS: &str = "id, job_request_id, job_type, job_version, user_id, organization_id, \
     job_priority, job_state, reservations, created_at, updated_at";

pub struct PostgresJobExecutionRepository {
    pool: PgPool,
}

impl PostgresJobExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::postgres::PgRow) -> SchedulerResult<JobExecution> {
        let state: String = row.try_get("job_state")?;
        let Json(reservations) = row.try_get("reservations")?;
        Ok(JobExecution {
            id: row.try_get("id")?,
            job_request_id: row.try_get::<i64, _>("job_request_id")? as u64,
            job_type: row.try_get("job_type")?,
            job_version: row.try_get("job_version")?,
            user_id: row.try_get("user_id")?,
            organization_id: row.try_get("organization_id")?,
            job_priority: row.try_get("job_priority")?,
            job_state: state.parse()?,
            reservations,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobExecutionRepository for PostgresJobExecutionRepository {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id, request_id = execution.job_request_id))]
    async fn create(&self, execution: &JobExecution) -> SchedulerResult<JobExecution> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_executions (id, job_request_id, job_type, job_version, user_id, organization_id,
                job_priority, job_state, reservations, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(&execution.id)
        .bind(execution.job_request_id as i64)
        .bind(&execution.job_type)
        .bind(&execution.job_version)
        .bind(&execution.user_id)
        .bind(&execution.organization_id)
        .bind(execution.job_priority)
        .bind(execution.job_state.as_str())
        .bind(Json(&execution.reservations))
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => SchedulerError::StateConflict(
                format!("请求 {} 已有未结束的执行记录", execution.job_request_id),
            ),
            other => SchedulerError::Database(other),
        })?;
        debug!("创建执行记录 {}", execution.id);
        Self::row_to_execution(&row)
    }

    async fn get(&self, id: &str) -> SchedulerResult<JobExecution> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM job_executions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::JobExecutionNotFound { id: id.to_string() })?;
        Self::row_to_execution(&row)
    }

    async fn find_by_request(&self, job_request_id: u64) -> SchedulerResult<Vec<JobExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM job_executions WHERE job_request_id = $1 ORDER BY created_at"
        ))
        .bind(job_request_id as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn update_state(&self, id: &str, state: JobState) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE job_executions SET job_state = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobExecutionNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM job_executions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
