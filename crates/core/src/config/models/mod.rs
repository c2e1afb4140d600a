pub mod app_config;
pub mod database;
pub mod jobs;
pub mod message_queue;
pub mod observability;

pub use app_config::AppConfig;
pub use database::{DatabaseConfig, DatabaseKind};
pub use jobs::JobsConfig;
pub use message_queue::{MessageQueueConfig, MessageQueueKind};
pub use observability::{LogFormat, ObservabilityConfig};
