//! Prometheus metrics for the Analytix server.
//!
//! This module provides:
//! - HTTP request metrics (count, latency, in-flight requests)
//! - Rate limiter decisions and store failures
//! - Cache accessor hit/miss/single-flight counters
//! - Streaming hub connection and delivery metrics

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const HTTP_ACTIVE_REQUESTS: &str = "http_active_requests";

    // Rate limiter metrics
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";
    pub const RATE_LIMIT_STORE_ERRORS_TOTAL: &str = "rate_limit_store_errors_total";

    // Cache metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_STALE_SERVED_TOTAL: &str = "cache_stale_served_total";
    pub const CACHE_SINGLEFLIGHT_JOINED_TOTAL: &str = "cache_singleflight_joined_total";
    pub const CACHE_COMPUTE_ERRORS_TOTAL: &str = "cache_compute_errors_total";

    // Streaming metrics
    pub const STREAM_CONNECTIONS_ACTIVE: &str = "stream_connections_active";
    pub const STREAM_EVENTS_BROADCAST_TOTAL: &str = "stream_events_broadcast_total";
    pub const STREAM_EVENTS_DROPPED_TOTAL: &str = "stream_events_dropped_total";
    pub const STREAM_HEARTBEAT_TIMEOUTS_TOTAL: &str = "stream_heartbeat_timeouts_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at server startup.
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Use install_recorder() for pull-based metrics (we serve /metrics ourselves)
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    // Normalize path to avoid high cardinality
    let normalized_path = normalize_path(path);

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => normalized_path.clone(),
        "status" => status.to_string(),
        "status_class" => status_class.to_string()
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => normalized_path
    )
    .record(duration.as_secs_f64());
}

pub fn increment_active_requests() {
    gauge!(names::HTTP_ACTIVE_REQUESTS).increment(1.0);
}

pub fn decrement_active_requests() {
    gauge!(names::HTTP_ACTIVE_REQUESTS).decrement(1.0);
}

// =============================================================================
// Rate Limiter Metrics
// =============================================================================

/// Record an admission decision. `outcome` is `admitted`, `rejected` or `degraded`.
pub fn record_rate_limit_decision(class: &'static str, outcome: &'static str) {
    counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "class" => class,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_rate_limit_store_error() {
    counter!(names::RATE_LIMIT_STORE_ERRORS_TOTAL).increment(1);
}

// =============================================================================
// Cache Metrics
// =============================================================================

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_cache_stale_served() {
    counter!(names::CACHE_STALE_SERVED_TOTAL).increment(1);
}

pub fn record_cache_singleflight_joined() {
    counter!(names::CACHE_SINGLEFLIGHT_JOINED_TOTAL).increment(1);
}

pub fn record_cache_compute_error() {
    counter!(names::CACHE_COMPUTE_ERRORS_TOTAL).increment(1);
}

// =============================================================================
// Streaming Metrics
// =============================================================================

pub fn set_stream_connections(count: usize) {
    gauge!(names::STREAM_CONNECTIONS_ACTIVE).set(count as f64);
}

/// Record one broadcast and how many connections it was queued to.
pub fn record_stream_broadcast(recipients: usize) {
    counter!(names::STREAM_EVENTS_BROADCAST_TOTAL).increment(recipients as u64);
}

pub fn record_stream_dropped(count: u64) {
    counter!(names::STREAM_EVENTS_DROPPED_TOTAL).increment(count);
}

pub fn record_stream_heartbeat_timeout() {
    counter!(names::STREAM_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
}

// =============================================================================
// Helpers
// =============================================================================

/// Normalize a path to reduce cardinality.
///
/// Replaces ids with placeholders to avoid creating too many unique label values.
fn normalize_path(path: &str) -> String {
    // /api/v1/analytics/documents/portfolios/42 -> /api/v1/analytics/documents/portfolios/{id}
    path.split('/')
        .map(|part| if is_likely_id(part) { "{id}" } else { part })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check if a string looks like an ID (UUID, numeric or long token).
fn is_likely_id(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }

    // UUID pattern (with or without dashes)
    if s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4 {
        return true;
    }
    if s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }

    // Numeric ID
    if s.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // Long alphanumeric (likely an ID)
    s.len() > 12 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
