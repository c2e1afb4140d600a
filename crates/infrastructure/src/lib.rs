pub mod database;
pub mod health;
pub mod in_memory_queue;
pub mod message_queue;
pub mod observability;

pub use database::{DatabaseManager, MemoryStores, Repositories};
pub use health::{DependencyHealthMonitor, StaticHealthMonitor};
pub use in_memory_queue::{InMemoryMessageQueue, InMemoryQueueConfig};
pub use message_queue::RabbitMqMessageQueue;
pub use observability::SchedulerMetrics;
