use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use analytix_auth::AuthGate;
use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRef},
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheAccessor;
use crate::config::AppConfig;
use crate::error::StartupError;
use crate::handlers;
use crate::hub::{EventHub, HubConfig};
use crate::pipeline::{
    AuthStage, CorsStage, DeadlineStage, LoggingStage, MetricsStage, Pipeline, RateLimitStage,
    RecoveryStage, Stage,
};
use crate::ratelimit::RateLimiter;
use crate::store::{
    CacheStore, CounterStore, DocumentStore, PgDocumentStore, RedisCacheStore, RedisCounterStore,
    StoreError, connect_postgres, connect_redis,
};

/// Shared handles available to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gate: Arc<AuthGate>,
    pub hub: EventHub,
    pub cache: CacheAccessor,
    pub limiter: RateLimiter,
    pub documents: Arc<dyn DocumentStore>,
    pub cache_store: Arc<dyn CacheStore>,
    pub counters: Arc<dyn CounterStore>,
}

impl FromRef<AppState> for Arc<AuthGate> {
    fn from_ref(state: &AppState) -> Self {
        state.gate.clone()
    }
}

/// Global stages, outermost first.
pub fn standard_pipeline(state: &AppState) -> Pipeline {
    let config = &state.config;
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(RecoveryStage),
        Arc::new(LoggingStage),
        Arc::new(CorsStage::new(&config.cors)),
        Arc::new(RateLimitStage::new(
            state.limiter.clone(),
            config.rate_limit.clone(),
            config.cache.key_prefix.clone(),
        )),
        Arc::new(MetricsStage),
        Arc::new(DeadlineStage::new(config.request_timeout())),
    ];
    let pipeline = Pipeline::new(stages);
    tracing::debug!(stages = ?pipeline.names(), "request pipeline assembled");
    pipeline
}

pub fn build_router(
    state: AppState,
    public_routes: Vec<Router<AppState>>,
    protected_routes: Vec<Router<AppState>>,
) -> Router {
    let mut protected = Router::new()
        .route("/api/v1/analytics/events", post(handlers::publish_event))
        .route(
            "/api/v1/analytics/documents/{collection}/{id}",
            get(handlers::read_document),
        )
        .route(
            "/api/v1/admin/cache/documents/{collection}/{id}",
            delete(handlers::invalidate_document),
        );
    for routes in protected_routes {
        protected = protected.merge(routes);
    }
    let auth: Vec<Arc<dyn Stage>> = vec![Arc::new(AuthStage::new(state.gate.clone()))];
    let protected = Pipeline::new(auth).wrap_routes(protected);

    let mut app = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::prometheus_metrics))
        // Authenticates itself: browsers pass the token as a query parameter.
        .route("/ws/analytics", get(handlers::stream))
        .merge(protected);
    for routes in public_routes {
        app = app.merge(routes);
    }

    let app = app.layer(DefaultBodyLimit::max(state.config.server.body_limit_bytes));
    standard_pipeline(&state).wrap(app).with_state(state)
}

pub struct ServerBuilder {
    config: AppConfig,
    counters: Option<Arc<dyn CounterStore>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    documents: Option<Arc<dyn DocumentStore>>,
    public_routes: Vec<Router<AppState>>,
    protected_routes: Vec<Router<AppState>>,
}

impl ServerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            counters: None,
            cache_store: None,
            documents: None,
            public_routes: Vec::new(),
            protected_routes: Vec::new(),
        }
    }

    pub fn with_counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(store);
        self
    }

    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(store);
        self
    }

    /// Routes served without authentication.
    pub fn with_public_routes(mut self, routes: Router<AppState>) -> Self {
        self.public_routes.push(routes);
        self
    }

    /// Routes behind the bearer check.
    pub fn with_protected_routes(mut self, routes: Router<AppState>) -> Self {
        self.protected_routes.push(routes);
        self
    }

    /// Connects the stores that were not supplied, probes every store and
    /// assembles the router. Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<AnalytixServer, StartupError> {
        self.config.validate().map_err(StartupError::Config)?;
        let config = Arc::new(self.config);

        let gate = Arc::new(AuthGate::from_secret(
            config.auth.signing_secret.as_bytes(),
            config.auth.issuer.clone(),
            config.auth.leeway_secs,
        )?);

        let (counters, cache_store) = match (self.counters, self.cache_store) {
            (Some(counters), Some(cache_store)) => (counters, cache_store),
            (counters, cache_store) => {
                let pool = connect_redis(&config.redis).map_err(|source| StartupError::Connect {
                    store: "redis",
                    source,
                })?;
                let counters: Arc<dyn CounterStore> = match counters {
                    Some(store) => store,
                    None => Arc::new(RedisCounterStore::new(pool.clone())),
                };
                let cache_store: Arc<dyn CacheStore> = match cache_store {
                    Some(store) => store,
                    None => Arc::new(RedisCacheStore::new(pool)),
                };
                (counters, cache_store)
            }
        };

        let documents: Arc<dyn DocumentStore> = match self.documents {
            Some(store) => store,
            None => {
                let pool = connect_postgres(&config.storage.postgres).map_err(|source| {
                    StartupError::Connect {
                        store: "postgres",
                        source,
                    }
                })?;
                Arc::new(PgDocumentStore::new(pool))
            }
        };

        let postgres_timeout = config.storage.postgres.connect_timeout();
        let redis_timeout = config.redis.timeout();
        probe("document store", documents.ping(), postgres_timeout).await?;
        probe("cache store", cache_store.ping(), redis_timeout).await?;
        probe("counter store", counters.ping(), redis_timeout).await?;

        let state = AppState {
            gate,
            hub: EventHub::spawn(HubConfig::from(&config.stream)),
            cache: CacheAccessor::new(cache_store.clone(), config.cache.key_prefix.clone()),
            limiter: RateLimiter::new(counters.clone(), config.rate_limit.on_store_error)
                .with_store_timeout(redis_timeout),
            documents,
            cache_store,
            counters,
            config,
        };
        tracing::info!(
            rate_limit = state.config.rate_limit.enabled,
            on_store_error = ?state.limiter.policy(),
            queue_capacity = state.hub.config().queue_capacity,
            "server state initialized"
        );
        let router = build_router(state.clone(), self.public_routes, self.protected_routes);

        Ok(AnalytixServer {
            state,
            router,
            shutdown: CancellationToken::new(),
        })
    }
}

async fn probe(
    store: &'static str,
    check: impl Future<Output = Result<(), StoreError>>,
    timeout: Duration,
) -> Result<(), StartupError> {
    match tokio::time::timeout(timeout, check).await {
        Ok(Ok(())) => {
            tracing::info!(store, "store reachable");
            Ok(())
        }
        Ok(Err(source)) => Err(StartupError::Probe { store, source }),
        Err(_) => Err(StartupError::Probe {
            store,
            source: StoreError::unavailable(format!(
                "no response within {}ms",
                timeout.as_millis()
            )),
        }),
    }
}

pub struct AnalytixServer {
    state: AppState,
    router: Router,
    shutdown: CancellationToken,
}

impl AnalytixServer {
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Cancelling this token starts a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, StartupError> {
        let addr = self.state.config.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })?;
        tracing::info!(%addr, "listening");
        Ok(listener)
    }

    /// Serves on `listener` until `signal` resolves, then drains HTTP
    /// requests and stream connections for up to the shutdown grace period.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            state,
            router,
            shutdown,
        } = self;
        let hub = state.hub.clone();
        let grace = state.config.shutdown_grace();

        let stop_accepting = shutdown.clone();
        let mut http = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
            .await
        });

        tokio::select! {
            _ = signal => tracing::info!("shutdown signal received"),
            _ = shutdown.cancelled() => tracing::info!("shutdown requested"),
            result = &mut http => {
                hub.shutdown().await;
                result??;
                return Ok(());
            }
        }

        let started = Instant::now();
        shutdown.cancel();
        hub.shutdown().await;

        let drain = async {
            let served = (&mut http).await;
            hub.wait_closed().await;
            served
        };
        let drained = tokio::time::timeout(grace, drain).await;

        match drained {
            Ok(served) => {
                served??;
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "shutdown complete"
                );
            }
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "grace period expired, forcing remaining work to stop"
                );
                http.abort();
                hub.force_close();
                if tokio::time::timeout(Duration::from_secs(1), hub.wait_closed())
                    .await
                    .is_err()
                {
                    tracing::warn!("stream connections did not stop after force close");
                }
            }
        }
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
