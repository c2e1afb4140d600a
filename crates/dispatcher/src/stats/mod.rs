//! 作业统计与排队估算

pub mod job_stats;
pub mod registry;
pub mod wait_estimate;

pub use job_stats::{JobStats, JobStatsSnapshot};
pub use registry::StatsRegistry;
pub use wait_estimate::JobWaitEstimate;
