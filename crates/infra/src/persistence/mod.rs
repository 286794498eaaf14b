//! Key-value persistence boundary.
//!
//! The engine keeps job records, rate windows and the active-job index behind
//! this narrow interface. Backends only need `GET`, `PUT` with an optional TTL
//! and `DELETE`; they make no ordering or transaction promises.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryKeyValueStore;
#[cfg(feature = "redis")]
pub use redis::RedisKeyValueStore;
pub use r#trait::{KeyValueStore, StoreError};
