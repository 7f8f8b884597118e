//! Redis-backed store

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::KvStore;
use crate::error::{StoreError, StoreResult};

/// Increment unless the counter already reached ARGV[1]; returns -1 when limited.
const CHECK_AND_INCR_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return -1
end
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    check_and_incr: Script,
}

impl RedisStore {
    /// Connect to Redis (e.g. "redis://127.0.0.1:6379")
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("Invalid Redis URL: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;

        tracing::info!("Redis connection manager established");

        Ok(Self {
            conn,
            check_and_incr: Script::new(CHECK_AND_INCR_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        // SET NX replies OK on creation and nil when the key already exists
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn incr(&self, key: &str, by: i64) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn check_and_incr(
        &self,
        key: &str,
        limit: i64,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        let mut conn = self.conn();
        let value: i64 = self
            .check_and_incr
            .key(key)
            .arg(limit)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok((value >= 0).then_some(value))
    }

    async fn push_back(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("LPOP").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn trim(&self, key: &str, start: isize, stop: isize) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn();
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn remove(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.conn();
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(1)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
