use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};

use super::{Next, Stage};
use crate::config::RateLimitConfig;
use crate::error::ApiError;
use crate::metrics;
use crate::ratelimit::{Decision, RateLimiter, RouteClass, rate_key};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Admission control per route class and caller address.
pub struct RateLimitStage {
    limiter: RateLimiter,
    config: RateLimitConfig,
    key_prefix: String,
}

impl RateLimitStage {
    pub fn new(limiter: RateLimiter, config: RateLimitConfig, key_prefix: impl Into<String>) -> Self {
        Self {
            limiter,
            config,
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn apply(&self, request: Request, next: Next<'_>) -> Response {
        if !self.config.enabled {
            return next.run(request).await;
        }
        let Some(class) = RouteClass::classify(request.uri().path()) else {
            return next.run(request).await;
        };

        let caller = caller_address(&request, self.config.trust_forwarded_for);
        let limit = self.config.limits.for_class(class);
        let key = rate_key(&self.key_prefix, class, &caller);
        let decision = self.limiter.allow(&key, limit, self.config.window()).await;

        let outcome = match (decision.admitted, decision.degraded) {
            (_, true) => "degraded",
            (true, false) => "admitted",
            (false, false) => "rejected",
        };
        metrics::record_rate_limit_decision(class.as_str(), outcome);

        if !decision.admitted {
            tracing::info!(
                class = class.as_str(),
                caller = %caller,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            let mut response = ApiError::RateLimited {
                retry_after: decision.retry_after,
                limit,
            }
            .into_response();
            set_limit_headers(response.headers_mut(), &decision);
            return response;
        }

        let mut response = next.run(request).await;
        set_limit_headers(response.headers_mut(), &decision);
        response
    }
}

fn set_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
}

/// Socket peer address, or the first `X-Forwarded-For` hop behind a
/// trusted proxy.
fn caller_address(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for
        && let Some(first) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
