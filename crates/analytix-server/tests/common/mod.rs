//! Shared harness: builds a server over in-process stores and serves it on
//! an ephemeral port.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use analytix_server::store::{LocalCacheStore, LocalCounterStore, MemoryDocumentStore};
use analytix_server::{AnalytixServer, AppConfig, ServerBuilder};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SECRET: &str = "integration-test-secret-0123456789abcdef";

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.signing_secret = SECRET.to_string();
    // Tests serve on their own ephemeral listener; this only passes validation.
    config.server.port = 8080;
    config.server.shutdown_grace_secs = 30;
    config.stream.heartbeat_interval_secs = 5;
    config.stream.heartbeat_timeout_secs = 4;
    config
}

/// In-process stores kept by the test so it can seed and inspect them.
#[derive(Clone, Default)]
pub struct Stores {
    pub counters: LocalCounterStore,
    pub cache: LocalCacheStore,
    pub documents: MemoryDocumentStore,
}

pub fn builder(config: AppConfig, stores: &Stores) -> ServerBuilder {
    ServerBuilder::new(config)
        .with_counter_store(Arc::new(stores.counters.clone()))
        .with_cache_store(Arc::new(stores.cache.clone()))
        .with_document_store(Arc::new(stores.documents.clone()))
}

pub async fn build(config: AppConfig, stores: &Stores) -> AnalytixServer {
    builder(config, stores).build().await.expect("build server")
}

/// Issues a token signed with [`SECRET`].
pub fn token(server: &AnalytixServer, subject: &str, roles: &[&str]) -> String {
    server
        .state()
        .gate
        .jwt()
        .issue(subject, roles.iter().copied(), Duration::from_secs(300))
        .expect("issue token")
}

pub struct Running {
    pub base: String,
    pub ws_base: String,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<anyhow::Result<()>>,
}

/// Serves `server` until its shutdown token is cancelled.
pub async fn spawn(server: AnalytixServer) -> Running {
    let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.serve(listener, std::future::pending()));

    Running {
        base: format!("http://{addr}"),
        ws_base: format!("ws://{addr}"),
        shutdown,
        handle,
    }
}
