use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::AntResourceManager;

/// 回收循环：按存活超时的一半周期清理失联Ant与超时预留
pub(super) async fn run(manager: Arc<AntResourceManager>, mut shutdown: watch::Receiver<bool>) {
    let period = (manager.jobs_config().ant_registration_alive_timeout() / 2)
        .max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("启动资源回收循环，周期 {:?}", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (ants, allocations) = manager.reap();
                if ants > 0 || allocations > 0 {
                    info!(ants, allocations, "已回收失联Ant与超时预留");
                } else {
                    debug!("资源回收: 无需清理");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("收到停止信号，退出资源回收循环");
                    break;
                }
            }
        }
    }
}
