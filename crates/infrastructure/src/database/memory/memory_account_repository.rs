use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{Organization, ResourceUsage, User},
    repositories::AccountRepository,
};

/// 内存账户仓储；未登记的用户按无限制的普通用户处理
#[derive(Debug, Default)]
pub struct MemoryAccountRepository {
    users: RwLock<HashMap<String, User>>,
    organizations: RwLock<HashMap<String, Organization>>,
    usage: RwLock<HashMap<String, ResourceUsage>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: User) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn insert_organization(&self, organization: Organization) {
        self.organizations
            .write()
            .await
            .insert(organization.id.clone(), organization);
    }

    /// 设置用户或组织的用量
    pub async fn set_usage(&self, owner_id: &str, usage: ResourceUsage) {
        self.usage.write().await.insert(owner_id.to_string(), usage);
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn get_user(&self, id: &str) -> SchedulerResult<User> {
        if id.is_empty() {
            return Err(SchedulerError::UserNotFound { id: id.to_string() });
        }
        Ok(self
            .users
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(|| User::new(id)))
    }

    async fn get_organization(&self, id: &str) -> SchedulerResult<Organization> {
        self.organizations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::OrganizationNotFound { id: id.to_string() })
    }

    async fn usage(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        _since: DateTime<Utc>,
    ) -> SchedulerResult<ResourceUsage> {
        let owner = organization_id.unwrap_or(user_id);
        Ok(self
            .usage
            .read()
            .await
            .get(owner)
            .copied()
            .unwrap_or_default())
    }
}
