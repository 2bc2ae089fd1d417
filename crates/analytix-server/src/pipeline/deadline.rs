use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Next, Stage};
use crate::error::ApiError;

/// The request's deadline, available to handlers as an extension.
///
/// The token is cancelled when the deadline passes or the request finishes,
/// whichever comes first; pass it to [`CacheAccessor::get_until`].
///
/// [`CacheAccessor::get_until`]: crate::cache::CacheAccessor::get_until
#[derive(Debug, Clone)]
pub struct RequestDeadline {
    expires_at: Instant,
    token: CancellationToken,
}

impl RequestDeadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Bounds the rest of the chain by the configured request timeout.
pub struct DeadlineStage {
    timeout: Duration,
}

impl DeadlineStage {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Stage for DeadlineStage {
    fn name(&self) -> &'static str {
        "deadline"
    }

    async fn apply(&self, mut request: Request, next: Next<'_>) -> Response {
        let deadline = RequestDeadline::new(self.timeout);
        let _cancel_on_exit = deadline.token.clone().drop_guard();
        let token = deadline.token.clone();
        request.extensions_mut().insert(deadline);

        let path = request.uri().path().to_owned();
        match tokio::time::timeout(self.timeout, next.run(request)).await {
            Ok(response) => response,
            Err(_) => {
                token.cancel();
                tracing::warn!(
                    path = %path,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "request deadline exceeded"
                );
                ApiError::Timeout.into_response()
            }
        }
    }
}
