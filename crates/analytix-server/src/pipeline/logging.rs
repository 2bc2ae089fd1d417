use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use tokio::time::Instant;
use tracing::Instrument;

use super::{Next, Stage, X_REQUEST_ID, ensure_request_id};

/// Opens an `http.request` span per request and emits one access log line.
pub struct LoggingStage;

#[async_trait]
impl Stage for LoggingStage {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn apply(&self, mut request: Request, next: Next<'_>) -> Response {
        let request_id = ensure_request_id(&mut request);
        let span = tracing::info_span!(
            "http.request",
            http.method = %request.method(),
            http.target = %request.uri(),
            request_id = %request_id.as_str(),
            http.status_code = tracing::field::Empty,
        );

        let started = Instant::now();
        let mut response = next.run(request).instrument(span.clone()).await;
        let status = response.status().as_u16();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        span.record("http.status_code", status);
        span.in_scope(|| {
            if status >= 500 {
                tracing::warn!(status, elapsed_ms, "request handled");
            } else {
                tracing::info!(status, elapsed_ms, "request handled");
            }
        });

        response.headers_mut().insert(X_REQUEST_ID, request_id.0);
        response
    }
}
