use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Organization, ResourceUsage, Subscription, User},
    repositories::AccountRepository,
};

pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn get_user(&self, id: &str) -> SchedulerResult<User> {
        if id.is_empty() {
            return Err(SchedulerError::UserNotFound { id: id.to_string() });
        }
        let row = sqlx::query(
            "SELECT id, username, organization_id, max_concurrency, disabled, subscription FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        // 未登记的用户按无限制的普通用户处理
        let Some(row) = row else {
            return Ok(User::new(id));
        };
        let subscription: Option<Json<Subscription>> = row.try_get("subscription")?;
        Ok(User {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            organization_id: row.try_get("organization_id")?,
            max_concurrency: row.try_get::<i32, _>("max_concurrency")?.max(0) as u32,
            disabled: row.try_get("disabled")?,
            subscription: subscription.map(|Json(s)| s),
        })
    }

    async fn get_organization(&self, id: &str) -> SchedulerResult<Organization> {
        let row = sqlx::query(
            "SELECT id, name, max_concurrency, subscription FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SchedulerError::OrganizationNotFound { id: id.to_string() })?;

        let subscription: Option<Json<Subscription>> = row.try_get("subscription")?;
        Ok(Organization {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            max_concurrency: row.try_get::<i32, _>("max_concurrency")?.max(0) as u32,
            subscription: subscription.map(|Json(s)| s),
        })
    }

    async fn usage(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> SchedulerResult<ResourceUsage> {
        let owner = organization_id.filter(|org| !org.is_empty()).unwrap_or(user_id);
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(cpu_secs), 0)::BIGINT AS cpu_secs, COALESCE(SUM(disk_mb), 0)::BIGINT AS disk_mb
            FROM resource_usage WHERE owner_id = $1 AND recorded_at >= $2
            "#,
        )
        .bind(owner)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(ResourceUsage {
            cpu_secs: row.try_get("cpu_secs")?,
            disk_mb: row.try_get("disk_mb")?,
        })
    }
}
