//! Redis-backed counter and cache stores.

use std::time::Duration;

use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};

use super::{CacheStore, CounterStore, StoreError, WindowCount};
use crate::config::RedisConfig;

/// Create a Redis pool from configuration.
///
/// The pool is lazy: no connection is opened until first use, so callers
/// probe with [`CounterStore::ping`] before serving.
pub fn connect_redis(config: &RedisConfig) -> Result<Pool, StoreError> {
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    let timeout = config.timeout();
    let pool_config = redis_config
        .pool
        .get_or_insert_with(|| deadpool_redis::PoolConfig::new(config.pool_size));
    pool_config.max_size = config.pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| StoreError::Pool(e.to_string()))
}

async fn connection(pool: &Pool) -> Result<Connection, StoreError> {
    pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
}

async fn ping(pool: &Pool) -> Result<(), StoreError> {
    let mut conn = connection(pool).await?;
    let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}

// =============================================================================
// Counter Store
// =============================================================================

/// INCR and first-increment PEXPIRE in one server-side step. A key that lost
/// its expiry (e.g. created by a crashed script run) is re-armed.
const INCR_WINDOW_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

#[derive(Clone)]
pub struct RedisCounterStore {
    pool: Pool,
    script: Script,
}

impl RedisCounterStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            script: Script::new(INCR_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let mut conn = connection(&self.pool).await?;
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);

        // EVALSHA, falling back to EVAL when the script is not loaded yet
        let (count, ttl_ms): (i64, i64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowCount {
            count: u64::try_from(count).unwrap_or(0),
            ttl: Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0)),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        ping(&self.pool).await
    }
}

// =============================================================================
// Cache Store
// =============================================================================

#[derive(Clone)]
pub struct RedisCacheStore {
    pool: Pool,
}

impl RedisCacheStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = connection(&self.pool).await?;
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = connection(&self.pool).await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(key, value, ttl_ms).await?;
        tracing::debug!(key = %key, ttl_ms, "cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = connection(&self.pool).await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        ping(&self.pool).await
    }
}
