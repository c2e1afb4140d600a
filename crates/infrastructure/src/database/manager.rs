use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use scheduler_core::{
    config::{DatabaseConfig, DatabaseKind},
    LeaseStore, SchedulerResult,
};
use scheduler_domain::repositories::{
    AccountRepository, JobDefinitionRepository, JobExecutionRepository, JobRequestRepository,
};

use super::memory::{
    MemoryAccountRepository, MemoryJobDefinitionRepository, MemoryJobExecutionRepository,
    MemoryJobRequestRepository, MemoryLeaseStore,
};
use super::postgres::{
    self, PostgresAccountRepository, PostgresJobDefinitionRepository,
    PostgresJobExecutionRepository, PostgresJobRequestRepository, PostgresLeaseStore,
};

/// 调度器使用的全部存储端口
#[derive(Clone)]
pub struct Repositories {
    pub job_requests: Arc<dyn JobRequestRepository>,
    pub job_definitions: Arc<dyn JobDefinitionRepository>,
    pub job_executions: Arc<dyn JobExecutionRepository>,
    pub accounts: Arc<dyn AccountRepository>,
    pub leases: Arc<dyn LeaseStore>,
}

/// 进程内存储的具体类型，便于测试直接操作
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub job_requests: Arc<MemoryJobRequestRepository>,
    pub job_definitions: Arc<MemoryJobDefinitionRepository>,
    pub job_executions: Arc<MemoryJobExecutionRepository>,
    pub accounts: Arc<MemoryAccountRepository>,
    pub leases: Arc<MemoryLeaseStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repositories(&self) -> Repositories {
        Repositories {
            job_requests: self.job_requests.clone(),
            job_definitions: self.job_definitions.clone(),
            job_executions: self.job_executions.clone(),
            accounts: self.accounts.clone(),
            leases: self.leases.clone(),
        }
    }
}

enum Backend {
    InMemory(MemoryStores),
    Postgres(PgPool),
}

/// 按配置选择存储实现
pub struct DatabaseManager {
    backend: Backend,
    repositories: Repositories,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        match config.kind {
            DatabaseKind::InMemory => {
                info!("使用进程内存储");
                Ok(Self::in_memory(MemoryStores::new()))
            }
            DatabaseKind::Postgres => {
                let pool = postgres::connect(config).await?;
                let repositories = Repositories {
                    job_requests: Arc::new(PostgresJobRequestRepository::new(pool.clone())),
                    job_definitions: Arc::new(PostgresJobDefinitionRepository::new(pool.clone())),
                    job_executions: Arc::new(PostgresJobExecutionRepository::new(pool.clone())),
                    accounts: Arc::new(PostgresAccountRepository::new(pool.clone())),
                    leases: Arc::new(PostgresLeaseStore::new(pool.clone())),
                };
                Ok(Self {
                    backend: Backend::Postgres(pool),
                    repositories,
                })
            }
        }
    }

    pub fn in_memory(stores: MemoryStores) -> Self {
        let repositories = stores.repositories();
        Self {
            backend: Backend::InMemory(stores),
            repositories,
        }
    }

    pub fn kind(&self) -> DatabaseKind {
        match self.backend {
            Backend::InMemory(_) => DatabaseKind::InMemory,
            Backend::Postgres(_) => DatabaseKind::Postgres,
        }
    }

    pub fn repositories(&self) -> Repositories {
        self.repositories.clone()
    }

    /// 进程内存储时返回具体实现
    pub fn memory_stores(&self) -> Option<&MemoryStores> {
        match &self.backend {
            Backend::InMemory(stores) => Some(stores),
            Backend::Postgres(_) => None,
        }
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        if let Backend::Postgres(pool) = &self.backend {
            sqlx::query("SELECT 1").execute(pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Backend::Postgres(pool) = &self.backend {
            pool.close().await;
        }
    }
}
