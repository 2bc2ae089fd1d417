use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use tokio::time::Instant;

use super::{Next, Stage};
use crate::metrics;

/// Records request counts, latency and the in-flight gauge.
pub struct MetricsStage;

/// Keeps the in-flight gauge right when the request is cancelled or panics.
struct ActiveRequest;

impl ActiveRequest {
    fn start() -> Self {
        metrics::increment_active_requests();
        Self
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        metrics::decrement_active_requests();
    }
}

#[async_trait]
impl Stage for MetricsStage {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn apply(&self, request: Request, next: Next<'_>) -> Response {
        let _active = ActiveRequest::start();
        let method = request.method().to_string();
        let path = request.uri().path().to_owned();
        let started = Instant::now();

        let response = next.run(request).await;
        metrics::record_http_request(&method, &path, response.status().as_u16(), started.elapsed());
        response
    }
}
