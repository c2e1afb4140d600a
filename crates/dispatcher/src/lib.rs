//! 调度核心
//!
//! 资源管理、作业统计、单次调度尝试的执行状态机，以及驱动它们的调度器。

pub mod execution;
pub mod lifecycle_listener;
pub mod resource;
pub mod rolling_stat;
pub mod scheduler;
pub mod stats;

pub use execution::{JobExecutionStateMachine, ScheduleOutcome, SchedulingContext};
pub use lifecycle_listener::JobLifecycleListener;
pub use resource::{AntResourceManager, ContainerSort, ResourceManager};
pub use rolling_stat::{LatencySummary, RollingAverage, RollingMinMax};
pub use scheduler::{JobScheduler, LeaderElection, PassResult, SchedulerStats};
pub use stats::{JobStats, JobStatsSnapshot, JobWaitEstimate, StatsRegistry};
