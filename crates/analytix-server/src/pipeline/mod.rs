//! Ordered request pipeline.
//!
//! Cross-cutting behaviour is a fixed list of [`Stage`]s composed at startup
//! and installed as one axum middleware. Each stage sees the request, may
//! answer it directly, and otherwise hands it to the rest of the chain
//! through [`Next`].
//!
//! The global order is:
//!
//! ```text
//! recovery → logging → cors → rate_limit → metrics → deadline → router
//! ```
//!
//! Protected routers get a second pipeline holding only the auth stage.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::response::Response;

pub mod auth;
pub mod cors;
pub mod deadline;
pub mod logging;
pub mod metrics;
pub mod rate_limit;
pub mod recovery;

pub use self::auth::AuthStage;
pub use self::cors::CorsStage;
pub use self::deadline::{DeadlineStage, RequestDeadline};
pub use self::logging::LoggingStage;
pub use self::metrics::MetricsStage;
pub use self::rate_limit::RateLimitStage;
pub use self::recovery::RecoveryStage;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn apply(&self, request: Request, next: Next<'_>) -> Response;
}

/// The remainder of the chain after the current stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    endpoint: axum::middleware::Next,
}

impl Next<'_> {
    pub async fn run(self, request: Request) -> Response {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                stage
                    .apply(
                        request,
                        Next {
                            stages: rest,
                            endpoint: self.endpoint,
                        },
                    )
                    .await
            }
            None => self.endpoint.run(request).await,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Middleware entry point, for `axum::middleware::from_fn_with_state`.
    pub async fn handle(
        State(pipeline): State<Pipeline>,
        request: Request,
        next: axum::middleware::Next,
    ) -> Response {
        Next {
            stages: &pipeline.stages,
            endpoint: next,
        }
        .run(request)
        .await
    }

    /// Wraps `router` so every request passes through this pipeline.
    pub fn wrap<S>(self, router: axum::Router<S>) -> axum::Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(axum::middleware::from_fn_with_state(self, Self::handle))
    }

    /// Like [`wrap`](Self::wrap) but only for matched routes, so unmatched
    /// paths still 404 instead of failing the stage.
    pub fn wrap_routes<S>(self, router: axum::Router<S>) -> axum::Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(axum::middleware::from_fn_with_state(self, Self::handle))
    }
}

/// Request id attached by the outermost stage.
#[derive(Debug, Clone)]
pub struct RequestId(pub HeaderValue);

impl RequestId {
    pub fn as_str(&self) -> &str {
        self.0.to_str().unwrap_or("-")
    }
}

/// Returns the request's id, assigning one from `X-Request-Id` or a new v4
/// UUID if none is attached yet.
pub fn ensure_request_id(request: &mut Request) -> RequestId {
    if let Some(id) = request.extensions().get::<RequestId>() {
        return id.clone();
    }
    let value = request
        .headers()
        .get(&X_REQUEST_ID)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("-"))
        });
    let id = RequestId(value);
    request.extensions_mut().insert(id.clone());
    id
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    use super::*;

    struct Tag {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Stage for Tag {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn apply(&self, request: Request, next: Next<'_>) -> Response {
            self.seen.lock().push(self.name);
            next.run(request).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Stage for ShortCircuit {
        fn name(&self) -> &'static str {
            "short"
        }

        async fn apply(&self, _request: Request, _next: Next<'_>) -> Response {
            StatusCode::IM_A_TEAPOT.into_response()
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stage = |name| -> Arc<dyn Stage> {
            Arc::new(Tag {
                name,
                seen: seen.clone(),
            })
        };
        let pipeline = Pipeline::new(vec![stage("a"), stage("b"), stage("c")]);
        assert_eq!(pipeline.names(), vec!["a", "b", "c"]);

        let app = pipeline.wrap(axum::Router::new().route("/", get(|| async { "ok" })));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stage_can_answer_directly() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Arc::new(ShortCircuit),
            Arc::new(Tag {
                name: "after",
                seen: seen.clone(),
            }),
        ]);

        let app = pipeline.wrap(axum::Router::new().route("/", get(|| async { "ok" })));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_request_id_preserved_or_generated() {
        let mut with_header = Request::builder()
            .header("x-request-id", "abc-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(ensure_request_id(&mut with_header).as_str(), "abc-123");

        let mut without = Request::builder().body(Body::empty()).unwrap();
        let generated = ensure_request_id(&mut without);
        assert!(uuid::Uuid::parse_str(generated.as_str()).is_ok());
        // Stable once attached.
        assert_eq!(ensure_request_id(&mut without).as_str(), generated.as_str());
    }
}
