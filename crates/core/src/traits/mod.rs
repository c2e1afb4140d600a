pub mod health;
pub mod lease;
pub mod message_queue;

pub use health::HealthMonitor;
pub use lease::LeaseStore;
pub use message_queue::{MessageHandler, MessageHeaders, MessageQueue, QueueMessage, SubscribeOptions};
