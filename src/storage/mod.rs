//! Shared state store abstraction and its implementations.

mod error;
mod memory;
mod redis_store;
mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{BoundedIncr, KeySpace, Notifications, SharedStore};
