pub mod entities;
pub mod events;
pub mod repositories;

pub use entities::*;
pub use events::*;
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
