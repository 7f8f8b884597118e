//! In-memory store
//!
//! Single-process stand-in for Redis used by tests and local development.
//! Supports outage injection so fail-open and retry paths can be exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::KvStore;
use crate::error::{StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    values: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    /// Successful `set` calls per key
    writes: HashMap<String, usize>,
    /// Key prefixes whose `set` calls fail
    failing_prefixes: Vec<String>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.values.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.values.remove(key);
        }
        self.values.get(key).map(|(v, _)| v)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a full outage: every command fails with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `set` fail for keys starting with `prefix`
    pub async fn fail_sets_with_prefix(&self, prefix: &str) {
        self.inner
            .lock()
            .await
            .failing_prefixes
            .push(prefix.to_string());
    }

    pub async fn clear_failures(&self) {
        self.inner.lock().await.failing_prefixes.clear();
    }

    /// Number of successful overwrites of `key`
    pub async fn write_count(&self, key: &str) -> usize {
        self.inner
            .lock()
            .await
            .writes
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

/// Resolve Redis-style inclusive indexes against a list of `len` items
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.inner.lock().await.live_value(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.failing_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            return Err(StoreError::Command(format!("injected write failure for {}", key)));
        }
        inner
            .values
            .insert(key.to_string(), (value.to_string(), deadline(ttl)));
        *inner.writes.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner
            .values
            .insert(key.to_string(), (value.to_string(), deadline(ttl)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.values.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let current = match inner.live_value(key) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| StoreError::Command(format!("{} is not an integer", key)))?,
            None => 0,
        };
        let next = current + by;
        let expiry = inner.values.get(key).and_then(|(_, d)| *d);
        inner.values.insert(key.to_string(), (next.to_string(), expiry));
        Ok(next)
    }

    async fn check_and_incr(
        &self,
        key: &str,
        limit: i64,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let current = inner
            .live_value(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if current >= limit {
            return Ok(None);
        }
        let expiry = if current == 0 {
            deadline(Some(ttl))
        } else {
            inner.values.get(key).and_then(|(_, d)| *d)
        };
        let next = current + 1;
        inner.values.insert(key.to_string(), (next.to_string(), expiry));
        Ok(Some(next))
    }

    async fn push_back(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_available()?;
        self.inner
            .lock()
            .await
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .await
            .lists
            .get_mut(key)
            .and_then(|list| list.pop_front()))
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn trim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(list) = inner.lists.get_mut(key) {
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => {
                    let kept: VecDeque<String> = list.range(from..=to).cloned().collect();
                    *list = kept;
                }
                None => list.clear(),
            }
        }
        Ok(())
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .await
            .lists
            .get(key)
            .map(|l| l.len())
            .unwrap_or(0))
    }

    async fn remove(&self, key: &str, value: &str) -> StoreResult<usize> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        match list.iter().position(|v| v == value) {
            Some(idx) => {
                list.remove(idx);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
