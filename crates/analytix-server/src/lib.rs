//! Admission and fan-out core for the Analytix service.
//!
//! Requests pass through a fixed [`pipeline`] of stages (recovery, logging,
//! CORS, rate limiting, metrics, deadline) before reaching a handler. The
//! [`hub`] pushes analytics events to WebSocket subscribers and the [`cache`]
//! collapses concurrent reads of the same key into one computation.

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod ratelimit;
pub mod server;
pub mod store;

pub use cache::{CacheAccessor, CacheError, ReadOptions, RefreshPolicy};
pub use config::AppConfig;
pub use error::{ApiError, StartupError};
pub use hub::{ConnectionId, ConnectionState, EventHub, HubConfig, HubError, Subscription};
pub use observability::init_tracing;
pub use pipeline::{Pipeline, Stage};
pub use ratelimit::{Decision, FailurePolicy, RateLimiter, RouteClass};
pub use server::{AnalytixServer, AppState, ServerBuilder, build_router, shutdown_signal};
