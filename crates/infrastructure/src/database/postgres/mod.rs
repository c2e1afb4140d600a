pub mod postgres_account_repository;
pub mod postgres_job_definition_repository;
pub mod postgres_job_execution_repository;
pub mod postgres_job_request_repository;
pub mod postgres_lease_store;

pub use postgres_account_repository::PostgresAccountRepository;
pub use postgres_job_definition_repository::PostgresJobDefinitionRepository;
pub use postgres_job_execution_repository::PostgresJobExecutionRepository;
pub use postgres_job_request_repository::PostgresJobRequestRepository;
pub use postgres_lease_store::PostgresLeaseStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use scheduler_core::{config::DatabaseConfig, SchedulerResult};

const SCHEMA: &str = include_str!("schema.sql");

/// 创建连接池并确保表结构存在
pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connection_timeout())
        .connect(&config.url)
        .await?;
    sqlx::raw_sql(SCHEMA).execute(&pool).await?;
    info!("PostgreSQL连接池已就绪: max_connections={}", config.max_connections);
    Ok(pool)
}
