use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use scheduler_core::{LeaseStore, SchedulerError, SchedulerResult};

/// 基于 scheduler_leases 表的租约
pub struct PostgresLeaseStore {
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> SchedulerResult<bool> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (name, holder, expires_at)
            VALUES ($1, $2, NOW() + $3 * INTERVAL '1 millisecond')
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE scheduler_leases.expires_at < NOW() OR scheduler_leases.holder = EXCLUDED.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.num_milliseconds() as f64)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(lease = name, holder = holder, acquired = acquired, "尝试获取租约");
        Ok(acquired)
    }

    async fn release(&self, name: &str, holder: &str) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn holder(&self, name: &str) -> SchedulerResult<Option<String>> {
        let row = sqlx::query(
            "SELECT holder FROM scheduler_leases WHERE name = $1 AND expires_at > NOW()",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("holder")?),
            None => None,
        })
    }
}
