//! Redis-backed counter and cache stores against a real Redis.
//!
//! **Requirements:** Docker running.
//!
//! Run with: cargo test -p analytix-server --test redis_stores -- --ignored

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use analytix_server::config::RedisConfig;
use analytix_server::store::{
    CacheStore, CounterStore, RedisCacheStore, RedisCounterStore, connect_redis,
};
use analytix_server::{CacheAccessor, FailurePolicy, RateLimiter, ReadOptions};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn redis_config() -> RedisConfig {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            (container, format!("redis://127.0.0.1:{host_port}"))
        })
        .await;

    RedisConfig {
        url: url.clone(),
        ..RedisConfig::default()
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn counter_window_counts_and_expires() {
    let pool = connect_redis(&redis_config().await).unwrap();
    let store = RedisCounterStore::new(pool);
    store.ping().await.unwrap();
    let key = unique("rl");

    for expected in 1..=3 {
        let counted = store
            .incr_window(&key, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(counted.count, expected);
        assert!(counted.ttl <= Duration::from_millis(500));
        assert!(counted.ttl > Duration::ZERO);
    }

    tokio::time::sleep(Duration::from_millis(700)).await;
    let counted = store
        .incr_window(&key, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(counted.count, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn limiter_admits_exactly_limit_per_window() {
    let pool = connect_redis(&redis_config().await).unwrap();
    let limiter = RateLimiter::new(
        Arc::new(RedisCounterStore::new(pool)),
        FailurePolicy::FailClosed,
    );
    let key = unique("caller");
    let window = Duration::from_secs(10);

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            tokio::spawn(async move { limiter.allow(&key, 5, window).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        let decision = handle.await.unwrap();
        assert!(!decision.degraded);
        if decision.admitted {
            admitted += 1;
        } else {
            assert!(decision.retry_after > Duration::ZERO);
            assert!(decision.retry_after <= window);
        }
    }
    assert_eq!(admitted, 5);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn cache_store_set_get_delete() {
    let pool = connect_redis(&redis_config().await).unwrap();
    let store = RedisCacheStore::new(pool);
    let key = unique("cache");

    assert_eq!(store.get(&key).await.unwrap(), None);
    store
        .set(&key, b"payload".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(store.get(&key).await.unwrap(), Some(b"payload".to_vec()));
    store.delete(&key).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn accessors_on_two_instances_share_entries() {
    let config = redis_config().await;
    let first = CacheAccessor::new(
        Arc::new(RedisCacheStore::new(connect_redis(&config).unwrap())),
        "analytix-test",
    );
    let second = CacheAccessor::new(
        Arc::new(RedisCacheStore::new(connect_redis(&config).unwrap())),
        "analytix-test",
    );
    let key = unique("dash");
    let computed = Arc::new(AtomicUsize::new(0));

    let counter = computed.clone();
    let value: Vec<u32> = first
        .get(&key, ReadOptions::ttl(Duration::from_secs(60)), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(vec![4, 2])
        })
        .await
        .unwrap();
    assert_eq!(value, vec![4, 2]);

    let counter = computed.clone();
    let value: Vec<u32> = second
        .get(&key, ReadOptions::ttl(Duration::from_secs(60)), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(vec![0])
        })
        .await
        .unwrap();
    assert_eq!(value, vec![4, 2]);
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}
