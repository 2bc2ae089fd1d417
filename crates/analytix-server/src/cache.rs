//! Cache-aside reads with process-local single-flight.
//!
//! [`CacheAccessor::get`] serves fresh entries from the shared [`CacheStore`]
//! and otherwise runs `compute` at most once per key at a time in this
//! process: concurrent callers for the same key join the running flight and
//! receive its result, or its error.
//!
//! ## Entry format
//!
//! Values are stored as MessagePack envelopes carrying their own creation time
//! and TTL, so freshness is decided by the reader rather than by when the
//! store happens to evict. With a stale-while-revalidate policy the physical
//! TTL is `ttl + stale_for`, leaving room to serve the old value while one
//! refresh runs in the background.
//!
//! ## Cancellation
//!
//! A flight lives as long as at least one caller awaits it. When every caller
//! is dropped (request deadline, client gone) the flight is dropped with
//! them, before its result is written.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::store::CacheStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type FlightOutput = Result<Arc<dyn Any + Send + Sync>, CacheError>;
type FlightFuture = BoxFuture<'static, FlightOutput>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// `compute` failed. Shared by every caller of the same flight.
    #[error("compute failed: {0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),

    #[error("cache codec error: {0}")]
    Codec(String),

    #[error("cache store error: {0}")]
    Store(String),

    #[error("cancelled")]
    Cancelled,
}

// =============================================================================
// Options
// =============================================================================

/// What a caller accepts when the entry is past its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Wait for a fresh value.
    #[default]
    Block,
    /// Serve a value up to `stale_for` past its TTL while one refresh runs.
    StaleWhileRevalidate { stale_for: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub ttl: Duration,
    pub policy: RefreshPolicy,
}

impl ReadOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            policy: RefreshPolicy::Block,
        }
    }

    pub fn stale_while_revalidate(mut self, stale_for: Duration) -> Self {
        self.policy = RefreshPolicy::StaleWhileRevalidate { stale_for };
        self
    }

    fn stale_for(&self) -> Duration {
        match self.policy {
            RefreshPolicy::Block => Duration::ZERO,
            RefreshPolicy::StaleWhileRevalidate { stale_for } => stale_for,
        }
    }

    fn physical_ttl(&self) -> Duration {
        self.ttl.saturating_add(self.stale_for())
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Wall clock used to stamp and age entries.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        analytix_core::now_utc().unix_millis()
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Serialize)]
struct EnvelopeRef<'a, V> {
    value: &'a V,
    created_at_ms: i64,
    ttl_ms: i64,
}

#[derive(Deserialize)]
struct Envelope<V> {
    value: V,
    created_at_ms: i64,
    ttl_ms: i64,
}

impl<V> Envelope<V> {
    fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    fn is_fresh(&self, now_ms: i64) -> bool {
        self.age_ms(now_ms) < self.ttl_ms
    }
}

// =============================================================================
// Accessor
// =============================================================================

struct Inner {
    store: Arc<dyn CacheStore>,
    prefix: String,
    clock: Arc<dyn Clock>,
    flights: Mutex<HashMap<String, (u64, WeakShared<FlightFuture>)>>,
    next_flight: AtomicU64,
}

/// Cheap to clone; clones share the single-flight registry.
#[derive(Clone)]
pub struct CacheAccessor {
    inner: Arc<Inner>,
}

impl CacheAccessor {
    pub fn new(store: Arc<dyn CacheStore>, prefix: impl Into<String>) -> Self {
        Self::with_clock(store, prefix, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CacheStore>,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                prefix: prefix.into(),
                clock,
                flights: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the cached value for `key`, computing and storing it on a miss.
    pub async fn get<V, F, Fut, E>(
        &self,
        key: &str,
        options: ReadOptions,
        compute: F,
    ) -> Result<V, CacheError>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let key = self.inner.namespaced(key);
        let now = self.inner.clock.now_millis();

        if let Some(entry) = self.inner.read::<V>(&key).await {
            if entry.is_fresh(now) {
                metrics::record_cache_hit();
                return Ok(entry.value);
            }
            if let RefreshPolicy::StaleWhileRevalidate { stale_for } = options.policy
                && entry.age_ms(now) < entry.ttl_ms.saturating_add(millis(stale_for))
            {
                metrics::record_cache_stale_served();
                let refresh = self.inner.flight(key, options, compute);
                tokio::spawn(async move {
                    let _ = refresh.await;
                });
                return Ok(entry.value);
            }
        }

        metrics::record_cache_miss();
        let output = self.inner.flight(key.clone(), options, compute).await?;
        output
            .downcast_ref::<V>()
            .cloned()
            .ok_or_else(|| CacheError::Codec(format!("type mismatch for key '{key}'")))
    }

    /// Like [`get`](Self::get), but gives up with [`CacheError::Cancelled`]
    /// once `cancel` fires.
    pub async fn get_until<V, F, Fut, E>(
        &self,
        key: &str,
        options: ReadOptions,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<V, CacheError>
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = self.get(key, options, compute) => result,
        }
    }

    /// Removes `key` from the shared store.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let key = self.inner.namespaced(key);
        self.inner
            .store
            .delete(&key)
            .await
            .map_err(|e| CacheError::Store(e.to_string()))
    }

    /// Number of flights currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.lock().len()
    }
}

impl Inner {
    fn namespaced(&self, key: &str) -> String {
        format!("{}:cache:{key}", self.prefix)
    }

    /// A store failure or an undecodable entry is treated as a miss.
    async fn read<V: DeserializeOwned>(&self, key: &str) -> Option<Envelope<V>> {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        match rmp_serde::from_slice::<Envelope<V>>(&bytes) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "undecodable cache entry, treating as miss");
                None
            }
        }
    }

    async fn write<V: Serialize + Sync>(&self, key: &str, value: &V, options: ReadOptions) {
        let bytes = match rmp_serde::to_vec_named(&EnvelopeRef {
            value,
            created_at_ms: self.clock.now_millis(),
            ttl_ms: millis(options.ttl),
        }) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache encode failed");
                return;
            }
        };

        if let Err(e) = self.store.set(key, bytes, options.physical_ttl()).await {
            tracing::warn!(key = %key, error = %e, "cache write failed");
        }
    }

    /// Joins the running flight for `key` or starts one.
    fn flight<V, F, Fut, E>(
        self: &Arc<Self>,
        key: String,
        options: ReadOptions,
        compute: F,
    ) -> Shared<FlightFuture>
    where
        V: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut flights = self.flights.lock();
        if let Some(running) = flights.get(&key).and_then(|(_, weak)| weak.upgrade()) {
            metrics::record_cache_singleflight_joined();
            return running;
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            inner: Arc::clone(self),
            key: key.clone(),
            id,
        };
        let inner = Arc::clone(self);
        let flight_key = key.clone();

        let flight = async move {
            let _guard = guard;
            let value = compute().await.map_err(|e| {
                let err: BoxError = e.into();
                metrics::record_cache_compute_error();
                tracing::warn!(key = %flight_key, error = %err, "cache compute failed");
                CacheError::Compute(Arc::from(err))
            })?;
            inner.write(&flight_key, &value, options).await;
            Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>)
        }
        .boxed()
        .shared();

        if let Some(weak) = flight.downgrade() {
            flights.insert(key, (id, weak));
        }
        flight
    }
}

/// Unregisters a flight when it finishes or is dropped.
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self.inner.flights.lock();
        if flights.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
            flights.remove(&self.key);
        }
    }
}
