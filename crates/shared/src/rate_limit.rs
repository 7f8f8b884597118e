//! Fixed-window rate limiting on top of the shared store
//!
//! Checks fail open: if the store cannot be reached the request is allowed
//! and the outage is logged. Product availability wins over strict quota
//! enforcement.

use std::time::Duration;

use serde::Serialize;

use crate::kv::SharedStore;

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left in the current window (0 when denied)
    pub remaining: i64,
    /// Seconds until the window resets when denied
    pub retry_after_seconds: Option<u64>,
    /// True when the decision was made without consulting the store
    pub fail_open: bool,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    namespace: String,
}

impl RateLimiter {
    pub fn new(store: SharedStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Count one request for `subject` against `limit` per `window`
    pub async fn check(&self, subject: &str, limit: i64, window: Duration) -> RateLimitResult {
        let key = format!("ratelimit:{}:{}", self.namespace, subject);

        match self.store.check_and_incr(&key, limit, window).await {
            Ok(Some(count)) => RateLimitResult {
                allowed: true,
                remaining: (limit - count).max(0),
                retry_after_seconds: None,
                fail_open: false,
            },
            Ok(None) => RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(window.as_secs()),
                fail_open: false,
            },
            Err(e) => {
                tracing::warn!(
                    namespace = %self.namespace,
                    subject = %subject,
                    error = %e,
                    "Rate limit store unreachable - failing open"
                );
                RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    retry_after_seconds: None,
                    fail_open: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_limit_is_enforced_per_subject() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store, "sync");
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(limiter.check("user-a", 3, window).await.allowed);
        }
        let denied = limiter.check("user-a", 3, window).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_seconds, Some(60));

        assert!(limiter.check("user-b", 3, window).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_is_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let limiter = RateLimiter::new(store, "sync");

        let result = limiter.check("user-a", 1, Duration::from_secs(60)).await;
        assert!(result.allowed);
        assert!(result.fail_open);
    }
}
