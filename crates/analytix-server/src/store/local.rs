//! In-process store implementations.
//!
//! Used for single-instance deployments and as test doubles. Expiry uses
//! `tokio::time::Instant` so tests can drive it with a paused clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CacheStore, CounterStore, DocumentStore, StoreError, WindowCount};

// =============================================================================
// Counter Store
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    length: Duration,
    count: u64,
}

/// Fixed windows kept in a `DashMap`; the entry lock makes each increment
/// atomic per key.
#[derive(Clone, Default)]
pub struct LocalCounterStore {
    windows: Arc<DashMap<String, Window>>,
}

impl LocalCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows that have already elapsed.
    pub fn purge_expired(&self) {
        self.windows
            .retain(|_, w| w.started_at.elapsed() < w.length);
    }
}

#[async_trait]
impl CounterStore for LocalCounterStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount, StoreError> {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            length: window,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= entry.length {
            *entry = Window {
                started_at: now,
                length: window,
                count: 0,
            };
        }
        entry.count += 1;

        let elapsed = now.duration_since(entry.started_at);
        Ok(WindowCount {
            count: entry.count,
            ttl: entry.length.saturating_sub(elapsed),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// Cache Store
// =============================================================================

/// A cached entry with TTL support.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl CachedEntry {
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() >= self.ttl
    }
}

#[derive(Clone, Default)]
pub struct LocalCacheStore {
    entries: Arc<DashMap<String, CachedEntry>>,
}

impl LocalCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for LocalCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.data.as_ref().clone()));
            }
            // Remove expired entry
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), CachedEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// =============================================================================
// Document Store
// =============================================================================

#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<DashMap<(String, String), serde_json::Value>>,
    reads: Arc<AtomicUsize>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: &str, id: &str, body: serde_json::Value) {
        self.documents
            .insert((collection.to_string(), id.to_string()), body);
    }

    /// Number of `find` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|doc| doc.value().clone()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_counter_fixed_window() {
        let store = LocalCounterStore::new();
        let window = Duration::from_secs(10);

        let first = store.incr_window("k", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.ttl, window);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = store.incr_window("k", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.ttl, Duration::from_secs(6));

        // A later increment must not extend the window.
        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = store.incr_window("k", window).await.unwrap();
        assert_eq!(fresh.count, 1);
        assert_eq!(fresh.ttl, window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_keys_are_independent() {
        let store = LocalCounterStore::new();
        let window = Duration::from_secs(10);
        store.incr_window("a", window).await.unwrap();
        store.incr_window("a", window).await.unwrap();
        assert_eq!(store.incr_window("b", window).await.unwrap().count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_purge() {
        let store = LocalCounterStore::new();
        store.incr_window("a", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        store.purge_expired();
        assert!(store.windows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiration() {
        let cache = LocalCacheStore::new();
        cache
            .set("key", b"value".to_vec(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(cache.get("key").await.unwrap(), Some(b"value".to_vec()));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("key").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_cache_delete() {
        let cache = LocalCacheStore::new();
        cache
            .set("key", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        cache.delete("key").await.unwrap();
        assert_eq!(cache.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_document_store() {
        let docs = MemoryDocumentStore::new();
        docs.insert("portfolios", "1", serde_json::json!({"name": "growth"}));

        assert_eq!(
            docs.find("portfolios", "1").await.unwrap(),
            Some(serde_json::json!({"name": "growth"}))
        );
        assert_eq!(docs.find("portfolios", "2").await.unwrap(), None);
        assert_eq!(docs.reads(), 2);
    }
}
