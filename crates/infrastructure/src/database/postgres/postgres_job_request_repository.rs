use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{JobRequestInfo, JobState, JobTypeCronTrigger},
    repositories::JobRequestRepository,
};

const SELECT_COLUMNS: &str = "id, job_definition_id, job_type, job_version, organization_id, user_id, user_key, \
     job_priority, job_state, schedule_attempts, retried, cron_triggered, scheduled_at, created_at, \
     updated_at, last_job_execution_id, error_code, error_message, params";

pub struct PostgresJobRequestRepository {
    pool: PgPool,
}

impl PostgresJobRequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_request(row: &sqlx::postgres::PgRow) -> SchedulerResult<JobRequestInfo> {
        let state: String = row.try_get("job_state")?;
        let params: serde_json::Value = row.try_get("params")?;
        let params: HashMap<String, String> = serde_json::from_value(params)?;
        Ok(JobRequestInfo {
            id: row.try_get::<i64, _>("id")? as u64,
            job_definition_id: row.try_get("job_definition_id")?,
            job_type: row.try_get("job_type")?,
            job_version: row.try_get("job_version")?,
            organization_id: row.try_get("organization_id")?,
            user_id: row.try_get("user_id")?,
            user_key: row.try_get("user_key")?,
            job_priority: row.try_get("job_priority")?,
            job_state: state.parse()?,
            schedule_attempts: row.try_get::<i32, _>("schedule_attempts")? as u32,
            retried: row.try_get::<i32, _>("retried")? as u32,
            cron_triggered: row.try_get("cron_triggered")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_job_execution_id: row.try_get("last_job_execution_id")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
            params,
        })
    }

    fn state_names(states: &[JobState]) -> Vec<String> {
        states.iter().map(|s| s.as_str().to_string()).collect()
    }
}

#[async_trait]
impl JobRequestRepository for PostgresJobRequestRepository {
    #[instrument(skip(self), fields(request_id = %id))]
    async fn get(&self, id: u64) -> SchedulerResult<JobRequestInfo> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM job_requests WHERE id = $1"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Self::row_to_request(&row),
            None => Err(SchedulerError::JobRequestNotFound { id }),
        }
    }

    #[instrument(skip(self, request), fields(request_id = %request.id, job_type = %request.job_type))]
    async fn save(&self, request: &JobRequestInfo) -> SchedulerResult<JobRequestInfo> {
        let params = serde_json::to_value(&request.params)?;
        let now = Utc::now();
        let row = if request.id == 0 {
            sqlx::query(&format!(
                r#"
                INSERT INTO job_requests (job_definition_id, job_type, job_version, organization_id, user_id,
                    user_key, job_priority, job_state, schedule_attempts, retried, cron_triggered, scheduled_at,
                    created_at, updated_at, last_job_execution_id, error_code, error_message, params)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                RETURNING {SELECT_COLUMNS}
                "#
            ))
            .bind(&request.job_definition_id)
            .bind(&request.job_type)
            .bind(&request.job_version)
            .bind(&request.organization_id)
            .bind(&request.user_id)
            .bind(&request.user_key)
            .bind(request.job_priority)
            .bind(request.job_state.as_str())
            .bind(request.schedule_attempts as i32)
            .bind(request.retried as i32)
            .bind(request.cron_triggered)
            .bind(request.scheduled_at)
            .bind(request.created_at)
            .bind(now)
            .bind(&request.last_job_execution_id)
            .bind(&request.error_code)
            .bind(&request.error_message)
            .bind(params)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                r#"
                UPDATE job_requests SET job_definition_id = $2, job_type = $3, job_version = $4,
                    organization_id = $5, user_id = $6, user_key = $7, job_priority = $8, job_state = $9,
                    schedule_attempts = $10, retried = $11, cron_triggered = $12, scheduled_at = $13,
                    updated_at = $14, last_job_execution_id = $15, error_code = $16, error_message = $17,
                    params = $18
                WHERE id = $1
                RETURNING {SELECT_COLUMNS}
                "#
            ))
            .bind(request.id as i64)
            .bind(&request.job_definition_id)
            .bind(&request.job_type)
            .bind(&request.job_version)
            .bind(&request.organization_id)
            .bind(&request.user_id)
            .bind(&request.user_key)
            .bind(request.job_priority)
            .bind(request.job_state.as_str())
            .bind(request.schedule_attempts as i32)
            .bind(request.retried as i32)
            .bind(request.cron_triggered)
            .bind(request.scheduled_at)
            .bind(now)
            .bind(&request.last_job_execution_id)
            .bind(&request.error_code)
            .bind(&request.error_message)
            .bind(params)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(SchedulerError::JobRequestNotFound { id: request.id })?
        };
        let saved = Self::row_to_request(&row)?;
        debug!("保存作业请求: {}", saved);
        Ok(saved)
    }

    async fn delete(&self, id: u64) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM job_requests WHERE id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobRequestNotFound { id });
        }
        Ok(())
    }

    #[instrument(skip(self, job_types))]
    async fn next_schedulable_job_requests_by_type(
        &self,
        job_types: &[String],
        limit: usize,
    ) -> SchedulerResult<Vec<JobRequestInfo>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM job_requests
            WHERE job_state = 'PENDING' AND scheduled_at <= NOW()
              AND (cardinality($1::text[]) = 0 OR job_type = ANY($1))
            ORDER BY job_priority DESC, created_at, id
            LIMIT $2
            "#
        ))
        .bind(job_types)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_request).collect()
    }

    async fn increment_schedule_attempts(
        &self,
        id: u64,
        scheduled_at: DateTime<Utc>,
        decrement_priority: i32,
        error_message: &str,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_requests SET schedule_attempts = schedule_attempts + 1, scheduled_at = $2,
                job_priority = job_priority - $3, error_message = $4, updated_at = NOW()
            WHERE id = $1 AND job_state = 'PENDING'
            "#,
        )
        .bind(id as i64)
        .bind(scheduled_at)
        .bind(decrement_priority)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM job_requests WHERE id = $1)")
            .bind(id as i64)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(SchedulerError::JobRequestNotFound { id });
        }
        Ok(false)
    }

    async fn requeue_orphan_job_requests(&self, stale: Duration) -> SchedulerResult<Vec<u64>> {
        let rows = sqlx::query(
            r#"
            UPDATE job_requests SET job_state = 'PENDING', scheduled_at = NOW(), updated_at = NOW()
            WHERE job_state = ANY($1) AND updated_at < NOW() - $2 * INTERVAL '1 second'
            RETURNING id
            "#,
        )
        .bind(Self::state_names(&[
            JobState::Ready,
            JobState::Started,
            JobState::Executing,
        ]))
        .bind(stale.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        let mut ids = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id").map(|id| id as u64))
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn find_missing_cron_scheduled_jobs_by_type(
        &self,
        triggers: &[JobTypeCronTrigger],
    ) -> SchedulerResult<Vec<JobTypeCronTrigger>> {
        if triggers.is_empty() {
            return Ok(Vec::new());
        }
        let job_types: Vec<String> = triggers.iter().map(|t| t.job_type.clone()).collect();
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT job_type, user_id, organization_id FROM job_requests
            WHERE cron_triggered AND job_type = ANY($1)
              AND job_state NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(job_types)
        .fetch_all(&self.pool)
        .await?;

        let mut active = Vec::with_capacity(rows.len());
        for row in &rows {
            let job_type: String = row.try_get("job_type")?;
            let user_id: String = row.try_get("user_id")?;
            let organization_id: Option<String> = row.try_get("organization_id")?;
            active.push((job_type, user_id, organization_id));
        }

        Ok(triggers
            .iter()
            .filter(|trigger| {
                !active.iter().any(|(job_type, user_id, organization_id)| {
                    *job_type == trigger.job_type
                        && (matches!((&trigger.organization_id, organization_id),
                            (Some(a), Some(b)) if !a.is_empty() && a == b)
                            || *user_id == trigger.user_id)
                })
            })
            .cloned()
            .collect())
    }

    async fn update_job_state(
        &self,
        id: u64,
        expected: &[JobState],
        new_state: JobState,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_requests SET job_state = $3, error_code = $4, error_message = $5, updated_at = NOW()
            WHERE id = $1 AND job_state = ANY($2)
            "#,
        )
        .bind(id as i64)
        .bind(Self::state_names(expected))
        .bind(new_state.as_str())
        .bind(error_code)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_ready_to_execute(&self, id: u64, job_execution_id: &str) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_requests SET job_state = 'READY', last_job_execution_id = $2, updated_at = NOW()
            WHERE id = $1 AND job_state = 'PENDING'
            "#,
        )
        .bind(id as i64)
        .bind(job_execution_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::StateConflict(format!(
                "请求 {id} 不存在或不是PENDING状态"
            )));
        }
        Ok(())
    }

    async fn revert_to_pending(&self, id: u64) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_requests SET job_state = 'PENDING', last_job_execution_id = NULL, updated_at = NOW()
            WHERE id = $1 AND job_state = 'READY'
            "#,
        )
        .bind(id as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
