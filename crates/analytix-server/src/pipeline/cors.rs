//! CORS policy for allow-listed browser origins, enforced by a
//! `tower_http` [`CorsLayer`] wrapped around the rest of the chain.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::response::{IntoResponse, Response};
use futures_util::future::BoxFuture;
use tower::{Layer, Service, ServiceExt};
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::{Next, Stage, X_REQUEST_ID};
use crate::config::CorsConfig;
use crate::error::ApiError;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

pub struct CorsStage {
    layer: CorsLayer,
}

impl CorsStage {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            layer: cors_layer(config),
        }
    }
}

/// Builds the CORS policy. A `*` entry allows any origin without
/// credentials, since browsers refuse that combination.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, X_REQUEST_ID])
        .expose_headers([
            X_REQUEST_ID,
            X_RATELIMIT_LIMIT,
            X_RATELIMIT_REMAINING,
            header::RETRY_AFTER,
        ])
        .max_age(Duration::from_secs(config.max_age_secs));

    if config.allowed_origins.iter().any(|o| o == "*") {
        if config.allow_credentials {
            tracing::warn!("cors wildcard origin configured, credentials disabled");
        }
        return layer.allow_origin(AllowOrigin::any());
    }

    let allowed: Arc<[String]> = config
        .allowed_origins
        .iter()
        .map(|o| o.trim_end_matches('/').to_ascii_lowercase())
        .collect();
    layer
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin_allowed(&allowed, origin)
        }))
        .allow_credentials(config.allow_credentials)
}

fn origin_allowed(allowed: &[String], origin: &HeaderValue) -> bool {
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    allowed.iter().any(|a| a.eq_ignore_ascii_case(origin))
}

/// Adapts the remaining chain into the service `CorsLayer` wraps.
struct NextService<'a>(Option<Next<'a>>);

impl<'a> Service<Request> for NextService<'a> {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'a, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let next = self.0.take();
        Box::pin(async move {
            Ok(match next {
                Some(next) => next.run(request).await,
                // Oneshot calls exactly once
                None => ApiError::internal("cors chain reused").into_response(),
            })
        })
    }
}

#[async_trait]
impl Stage for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn apply(&self, request: Request, next: Next<'_>) -> Response {
        let cors = self.layer.layer(NextService(Some(next)));
        match cors.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}
