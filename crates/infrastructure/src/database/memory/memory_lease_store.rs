use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use scheduler_core::{LeaseStore, SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// 进程内租约存储，同一进程内的多个调度器实例共享时才有意义
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    unavailable: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试辅助：让租约立即过期
    pub async fn expire(&self, name: &str) {
        if let Some(lease) = self.leases.lock().await.get_mut(name) {
            lease.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> SchedulerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseOperation("租约存储不可用".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> SchedulerResult<bool> {
        self.check_available()?;
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let now = Utc::now();
        let mut leases = self.leases.lock().await;
        let acquirable = leases
            .get(name)
            .map_or(true, |lease| lease.holder == holder || lease.expires_at <= now);
        if acquirable {
            leases.insert(
                name.to_string(),
                Lease {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(acquirable)
    }

    async fn release(&self, name: &str, holder: &str) -> SchedulerResult<()> {
        self.check_available()?;
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|lease| lease.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }

    async fn holder(&self, name: &str) -> SchedulerResult<Option<String>> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self
            .leases
            .lock()
            .await
            .get(name)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expired() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire("leader", "a", ttl).await.unwrap());
        assert!(!store.try_acquire("leader", "b", ttl).await.unwrap());
        assert!(store.try_acquire("leader", "a", ttl).await.unwrap());

        store.expire("leader").await;
        assert_eq!(store.holder("leader").await.unwrap(), None);
        assert!(store.try_acquire("leader", "b", ttl).await.unwrap());
        assert_eq!(store.holder("leader").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(30);
        store.try_acquire("leader", "a", ttl).await.unwrap();

        store.release("leader", "b").await.unwrap();
        assert_eq!(store.holder("leader").await.unwrap().as_deref(), Some("a"));

        store.release("leader", "a").await.unwrap();
        assert!(store.try_acquire("leader", "b", ttl).await.unwrap());
    }
}
