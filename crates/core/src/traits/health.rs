use async_trait::async_trait;

use crate::Result;

/// 外部依赖健康检查，每轮调度前调用一次
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    /// 所有依赖健康时返回 Ok，否则返回 `UnhealthyDependency`
    async fn health_status(&self) -> Result<()>;
}
