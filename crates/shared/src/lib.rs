// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tierlock Shared
//!
//! Storage primitives shared by the API, billing engine, and worker.
//! Everything that coordinates across request handlers goes through
//! [`KvStore`], so the crate deliberately has no notion of users or payments.

pub mod error;
pub mod kv;
pub mod rate_limit;

pub use error::{StoreError, StoreResult};
pub use kv::{KvStore, MemoryStore, RedisStore, SharedStore};
pub use rate_limit::{RateLimitResult, RateLimiter};
