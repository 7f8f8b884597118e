//! Key-value store abstraction
//!
//! The store is the only shared resource between stateless request handlers.
//! Two kinds of writes are used by callers:
//!
//! - **set-if-absent** for claims that must happen at most once (grant locks,
//!   dedup markers, cooldowns)
//! - **full overwrite** for records that are read-modify-written
//!
//! Lists back the FIFO queues and the capped audit trail. Index arguments
//! follow Redis `LRANGE`/`LTRIM` semantics (inclusive, negative from the tail).

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Store handle injected into services at startup
pub type SharedStore = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditional overwrite
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Returns true only if this call created the key
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64>;

    /// Atomically increment `key` unless it already reached `limit`.
    ///
    /// Returns the new value, or `None` when the limit was hit. The TTL is
    /// applied when the counter is created.
    async fn check_and_incr(&self, key: &str, limit: i64, ttl: Duration)
        -> StoreResult<Option<i64>>;

    async fn push_back(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn pop_front(&self, key: &str) -> StoreResult<Option<String>>;

    async fn range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>>;

    async fn trim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()>;

    async fn len(&self, key: &str) -> StoreResult<usize>;

    /// Remove the first occurrence of `value`; returns how many were removed
    async fn remove(&self, key: &str, value: &str) -> StoreResult<usize>;

    async fn ping(&self) -> StoreResult<()>;
}
