pub mod manager;
pub mod memory;
pub mod postgres;

pub use manager::{DatabaseManager, MemoryStores, Repositories};
