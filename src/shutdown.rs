use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

/// 优雅关闭管理器
pub struct ShutdownManager {
    /// 关闭后置为None，之后的订阅者立即收到信号
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        }
    }

    /// 订阅关闭信号
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        match self.shutdown_tx.lock().await.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                let _ = tx.send(());
                rx
            }
        }
    }

    /// 触发关闭，重复调用无副作用
    pub async fn shutdown(&self) {
        let Some(tx) = self.shutdown_tx.lock().await.take() else {
            debug!("关闭管理器已经触发过关闭");
            return;
        };
        debug!("发送关闭信号给 {} 个订阅者", tx.receiver_count());
        let _ = tx.send(());
        info!("关闭信号已发送");
    }

    pub async fn is_shutdown(&self) -> bool {
        self.shutdown_tx.lock().await.is_none()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待Ctrl+C或SIGTERM
pub async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("安装SIGTERM信号处理器失败: {e}"))?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.map_err(|e| anyhow::anyhow!("安装Ctrl+C信号处理器失败: {e}"))?;
                info!("收到Ctrl+C信号");
            }
            _ = terminate.recv() => {
                info!("收到SIGTERM信号");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("安装Ctrl+C信号处理器失败: {e}"))?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribers_receive_shutdown() {
        let manager = ShutdownManager::new();
        let mut first = manager.subscribe().await;
        let mut second = manager.subscribe().await;

        manager.shutdown().await;

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
        assert!(manager.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_late_subscriber_is_signalled_immediately() {
        let manager = ShutdownManager::new();
        manager.shutdown().await;
        manager.shutdown().await;

        let mut late = manager.subscribe().await;
        let received = tokio::time::timeout(Duration::from_millis(100), late.recv()).await;
        assert!(matches!(received, Ok(Ok(()))));
    }
}
