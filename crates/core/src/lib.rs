pub mod config;
pub mod errors;
pub mod logging;
pub mod traits;

pub use config::*;
pub use errors::*;
pub use traits::{
    HealthMonitor, LeaseStore, MessageHandler, MessageHeaders, MessageQueue, QueueMessage,
    SubscribeOptions,
};

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
