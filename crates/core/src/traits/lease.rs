use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// 带TTL的租约存储，用于调度器之间的领导者选举
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// 尝试获取或续期租约。租约空闲、已过期或已由 `holder` 持有时成功
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// 释放由 `holder` 持有的租约，不持有时不做任何事
    async fn release(&self, name: &str, holder: &str) -> Result<()>;

    /// 当前持有者
    async fn holder(&self, name: &str) -> Result<Option<String>>;
}
