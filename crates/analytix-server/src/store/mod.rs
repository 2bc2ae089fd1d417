//! Clients for the external stores the core depends on.
//!
//! Every component takes its store as an explicit `Arc<dyn ...>` handle so a
//! deployment can point at Redis/Postgres while tests substitute the
//! in-process implementations from [`local`].
//!
//! | Trait | Production | In-process |
//! |-------|------------|------------|
//! | [`CounterStore`] | [`RedisCounterStore`] | [`LocalCounterStore`] |
//! | [`CacheStore`] | [`RedisCacheStore`] | [`LocalCacheStore`] |
//! | [`DocumentStore`] | [`PgDocumentStore`] | [`MemoryDocumentStore`] |

use std::time::Duration;

use async_trait::async_trait;

pub mod local;
pub mod postgres;
pub mod redis;

pub use self::local::{LocalCacheStore, LocalCounterStore, MemoryDocumentStore};
pub use self::postgres::{PgDocumentStore, connect_postgres};
pub use self::redis::{RedisCacheStore, RedisCounterStore, connect_redis};

/// Errors returned by store clients.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx_core::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// State of a fixed window after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Requests counted in the current window, including this one
    pub count: u64,
    /// Time until the window expires
    pub ttl: Duration,
}

/// Shared counters backing the rate limiter.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically increments `key` and starts a `window`-long expiry if this
    /// is the first increment of the window.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Shared byte cache backing the cache accessor.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Read access to analytics documents.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn find(&self, collection: &str, id: &str)
    -> Result<Option<serde_json::Value>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
