use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 订阅计划，配额小于等于0表示不限制
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub plan: String,
    pub cpu_quota_secs: i64,
    pub disk_quota_mb: i64,
    pub ends_at: DateTime<Utc>,
}

impl Subscription {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.ends_at <= now
    }
}

/// 当前计费周期内的资源用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_secs: i64,
    pub disk_mb: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub organization_id: Option<String>,
    /// 0表示不限制
    pub max_concurrency: u32,
    pub disabled: bool,
    pub subscription: Option<Subscription>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            username: id.clone(),
            id,
            organization_id: None,
            max_concurrency: 0,
            disabled: false,
            subscription: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub max_concurrency: u32,
    pub subscription: Option<Subscription>,
}

impl Organization {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            max_concurrency: 0,
            subscription: None,
        }
    }
}
