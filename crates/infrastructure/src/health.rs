//! 依赖健康检查
//!
//! 每轮调度前调用一次。任何一个依赖检查失败或超时，本轮调度都会被放弃。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use scheduler_core::{HealthMonitor, SchedulerError, SchedulerResult};

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, SchedulerResult<()>> + Send + Sync>;

struct NamedCheck {
    name: String,
    check: CheckFn,
}

/// 聚合多个命名检查，每个检查都受同一个超时约束
pub struct DependencyHealthMonitor {
    checks: Vec<NamedCheck>,
    timeout: Duration,
}

impl DependencyHealthMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: Vec::new(),
            timeout,
        }
    }

    /// 注册一个检查，`check` 每次调用都返回一个新的future
    pub fn with_check<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, SchedulerResult<()>> + Send + Sync + 'static,
    {
        self.checks.push(NamedCheck {
            name: name.into(),
            check: Arc::new(check),
        });
        self
    }

    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name.as_str()).collect()
    }
}

#[async_trait]
impl HealthMonitor for DependencyHealthMonitor {
    async fn health_status(&self) -> SchedulerResult<()> {
        let timeout = self.timeout;
        let results = join_all(self.checks.iter().map(|named| {
            let fut = (named.check)();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(format!("{}: {}", named.name, e)),
                    Err(_) => Err(format!("{}: 检查超时({:?})", named.name, timeout)),
                }
            }
        }))
        .await;

        let failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            debug!("依赖健康检查通过: {} 项", self.checks.len());
            return Ok(());
        }
        warn!(failures = ?failures, "依赖健康检查失败");
        Err(SchedulerError::UnhealthyDependency(failures.join("; ")))
    }
}

/// 固定结果的健康检查，可在运行时切换
#[derive(Debug, Default)]
pub struct StaticHealthMonitor {
    unhealthy: AtomicBool,
}

impl StaticHealthMonitor {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthMonitor for StaticHealthMonitor {
    async fn health_status(&self) -> SchedulerResult<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(SchedulerError::UnhealthyDependency(
                "依赖被标记为不健康".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_all_checks_pass() {
        let monitor = DependencyHealthMonitor::new(Duration::from_millis(100))
            .with_check("database", || async { Ok(()) }.boxed())
            .with_check("queue", || async { Ok(()) }.boxed());
        assert!(monitor.health_status().await.is_ok());
        assert_eq!(monitor.check_names(), vec!["database", "queue"]);
    }

    #[tokio::test]
    async fn test_failing_and_hung_checks_are_reported() {
        let monitor = DependencyHealthMonitor::new(Duration::from_millis(50))
            .with_check("database", || {
                async { Err(SchedulerError::DatabaseOperation("连接被拒绝".to_string())) }.boxed()
            })
            .with_check("queue", || {
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                .boxed()
            });

        let err = monitor.health_status().await.unwrap_err();
        match err {
            SchedulerError::UnhealthyDependency(message) => {
                assert!(message.contains("database"));
                assert!(message.contains("queue"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_static_monitor_toggles() {
        let monitor = StaticHealthMonitor::healthy();
        assert!(monitor.health_status().await.is_ok());
        monitor.set_healthy(false);
        assert!(monitor.health_status().await.is_err());
    }
}
