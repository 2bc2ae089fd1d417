//! HTTP pipeline behaviour through the assembled router.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use analytix_server::store::{
    CounterStore, DocumentStore, MemoryDocumentStore, StoreError, WindowCount,
};
use analytix_server::{FailurePolicy, StartupError};
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use axum::routing::get;
use common::{Stores, build, builder, test_config, token};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.expect("infallible")
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn authed(method: Method, uri: &str, bearer: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap()
}

/// Healthy at startup; flips to failing on demand.
#[derive(Clone, Default)]
struct FlakyDocuments {
    inner: MemoryDocumentStore,
    down: Arc<AtomicBool>,
}

#[async_trait]
impl DocumentStore for FlakyDocuments {
    async fn find(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection refused"));
        }
        self.inner.find(collection, id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection refused"));
        }
        Ok(())
    }
}

/// Documents whose ping is slower than a Redis round trip.
#[derive(Clone, Default)]
struct SlowPingDocuments {
    inner: MemoryDocumentStore,
}

#[async_trait]
impl DocumentStore for SlowPingDocuments {
    async fn find(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.inner.find(collection, id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }
}

/// Answers pings but never completes an increment.
struct HungCounters;

#[async_trait]
impl CounterStore for HungCounters {
    async fn incr_window(&self, _: &str, _: Duration) -> Result<WindowCount, StoreError> {
        std::future::pending().await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[test]
fn shared_test_config_is_valid() {
    test_config().validate().expect("test config validates");
}

#[tokio::test]
async fn health_reports_ok_with_request_id() {
    let server = build(test_config(), &Stores::default()).await;
    let response = send(&server.router(), get_req("/health")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "analytix");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn request_id_is_echoed_when_supplied() {
    let server = build(test_config(), &Stores::default()).await;
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-abc")
        .body(Body::empty())
        .unwrap();
    let response = send(&server.router(), request).await;
    assert_eq!(response.headers()["x-request-id"], "req-abc");
}

#[tokio::test]
async fn protected_routes_require_bearer() {
    let server = build(test_config(), &Stores::default()).await;
    let app = server.router();

    let response = send(&app, get_req("/api/v1/analytics/documents/dash/42")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &app,
        authed(
            Method::GET,
            "/api/v1/analytics/documents/dash/42",
            "not-a-jwt",
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn publishing_requires_publisher_role() {
    let server = build(test_config(), &Stores::default()).await;
    let app = server.router();
    let event = json!({ "topic": "portfolio:1", "type": "valuation", "payload": { "v": 1 } });

    let analyst = token(&server, "user-1", &["analyst"]);
    let response = send(
        &app,
        authed(
            Method::POST,
            "/api/v1/analytics/events",
            &analyst,
            Body::from(event.to_string()),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let publisher = token(&server, "svc-pricing", &["publisher"]);
    let response = send(
        &app,
        authed(
            Method::POST,
            "/api/v1/analytics/events",
            &publisher,
            Body::from(event.to_string()),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["delivered"], 0);

    let response = send(
        &app,
        authed(
            Method::POST,
            "/api/v1/analytics/events",
            &publisher,
            Body::from(json!({ "topic": "bad topic", "type": "x" }).to_string()),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sixth_request_in_window_is_rejected() {
    let mut config = test_config();
    config.rate_limit.limits.public = 5;
    config.rate_limit.window_secs = 10;
    let server = common::builder(config, &Stores::default())
        .with_public_routes(Router::new().route("/echo", get(|| async { "ok" })))
        .build()
        .await
        .unwrap();
    let app = server.router();

    for remaining in (0..5).rev() {
        let response = send(&app, get_req("/echo")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(
            response.headers()["x-ratelimit-remaining"],
            remaining.to_string().as_str()
        );
    }

    let response = send(&app, get_req("/echo")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=10).contains(&retry_after));
    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limited");

    // Probes are never limited
    let response = send(&app, get_req("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cors_preflight_and_disallowed_origin() {
    let server = build(test_config(), &Stores::default()).await;
    let app = server.router();

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/v1/analytics/events")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, preflight).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    assert!(headers.contains_key(header::ACCESS_CONTROL_MAX_AGE));

    let request = Request::builder()
        .uri("/health")
        .header(header::ORIGIN, "https://evil.example.com")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        !response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
    );
}

#[tokio::test]
async fn panicking_handler_becomes_500_and_server_keeps_serving() {
    let server = builder(test_config(), &Stores::default())
        .with_public_routes(Router::new().route(
            "/boom",
            get(|| async {
                if true {
                    panic!("handler exploded");
                }
                "unreachable"
            }),
        ))
        .build()
        .await
        .unwrap();
    let app = server.router();

    let response = send(&app, get_req("/boom")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["error"], "internal_error");
    assert!(!body.to_string().contains("exploded"));

    let response = send(&app, get_req("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn slow_handler_hits_deadline() {
    let mut config = test_config();
    config.server.request_timeout_ms = 100;
    let server = builder(config, &Stores::default())
        .with_public_routes(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .build()
        .await
        .unwrap();

    let response = send(&server.router(), get_req("/slow")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(json_body(response).await["error"], "timeout");
}

#[tokio::test]
async fn document_reads_are_cached_including_misses() {
    let stores = Stores::default();
    stores
        .documents
        .insert("dash", "42", json!({ "widgets": [1, 2, 3] }));
    let server = build(test_config(), &stores).await;
    let app = server.router();
    let bearer = token(&server, "user-1", &["analyst"]);

    for _ in 0..3 {
        let response = send(
            &app,
            authed(
                Method::GET,
                "/api/v1/analytics/documents/dash/42",
                &bearer,
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["widgets"], json!([1, 2, 3]));
    }
    assert_eq!(stores.documents.reads(), 1);

    for _ in 0..2 {
        let response = send(
            &app,
            authed(
                Method::GET,
                "/api/v1/analytics/documents/dash/missing",
                &bearer,
                Body::empty(),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(stores.documents.reads(), 2);
}

#[tokio::test]
async fn invalidation_requires_admin_and_forces_refetch() {
    let stores = Stores::default();
    stores.documents.insert("dash", "7", json!({ "rev": 1 }));
    let server = build(test_config(), &stores).await;
    let app = server.router();
    let analyst = token(&server, "user-1", &["analyst"]);
    let admin = token(&server, "ops", &["admin"]);
    let read = |bearer: &str| {
        authed(
            Method::GET,
            "/api/v1/analytics/documents/dash/7",
            bearer,
            Body::empty(),
        )
    };

    assert_eq!(json_body(send(&app, read(&analyst)).await).await["rev"], 1);
    stores.documents.insert("dash", "7", json!({ "rev": 2 }));
    assert_eq!(json_body(send(&app, read(&analyst)).await).await["rev"], 1);

    let uri = "/api/v1/admin/cache/documents/dash/7";
    let response = send(&app, authed(Method::DELETE, uri, &analyst, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = send(&app, authed(Method::DELETE, uri, &admin, Body::empty())).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(json_body(send(&app, read(&analyst)).await).await["rev"], 2);
}

#[tokio::test]
async fn failing_document_store_surfaces_as_503() {
    let stores = Stores::default();
    let documents = FlakyDocuments::default();
    let server = builder(test_config(), &stores)
        .with_document_store(Arc::new(documents.clone()))
        .build()
        .await
        .unwrap();
    let app = server.router();
    let bearer = token(&server, "user-1", &["analyst"]);

    documents.down.store(true, Ordering::SeqCst);

    let response = send(&app, get_req("/ready")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["status"], "unavailable");
    assert_eq!(body["checks"]["cache_store"], "ok");
    assert!(body["checks"]["document_store"]["error"].is_string());

    let response = send(
        &app,
        authed(
            Method::GET,
            "/api/v1/analytics/documents/dash/1",
            &bearer,
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Errors are not cached: recovery is visible immediately
    documents.down.store(false, Ordering::SeqCst);
    documents.inner.insert("dash", "1", json!({ "ok": true }));
    let response = send(
        &app,
        authed(
            Method::GET,
            "/api/v1/analytics/documents/dash/1",
            &bearer,
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn hung_counter_store_falls_back_to_policy_quickly() {
    let mut config = test_config();
    config.server.request_timeout_ms = 2_000;
    config.redis.timeout_ms = 100;
    config.rate_limit.on_store_error = FailurePolicy::FailOpen;
    let server = builder(config, &Stores::default())
        .with_counter_store(Arc::new(HungCounters))
        .with_public_routes(Router::new().route("/echo", get(|| async { "ok" })))
        .build()
        .await
        .unwrap();
    let app = server.router();

    let started = Instant::now();
    let response = tokio::time::timeout(Duration::from_secs(5), send(&app, get_req("/echo")))
        .await
        .expect("hung store must not hang the request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn readiness_uses_each_store_timeout() {
    let mut config = test_config();
    config.redis.timeout_ms = 100;
    config.storage.postgres.connect_timeout_ms = 2_000;
    let server = builder(config, &Stores::default())
        .with_document_store(Arc::new(SlowPingDocuments::default()))
        .build()
        .await
        .unwrap();
    let app = server.router();

    let response = send(&app, get_req("/ready")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["checks"]["document_store"], "ok");
}

#[tokio::test]
async fn unreachable_store_aborts_startup() {
    let documents = FlakyDocuments::default();
    documents.down.store(true, Ordering::SeqCst);

    let result = builder(test_config(), &Stores::default())
        .with_document_store(Arc::new(documents))
        .build()
        .await;

    match result {
        Err(StartupError::Probe { store, .. }) => assert_eq!(store, "document store"),
        Err(other) => panic!("unexpected startup error: {other}"),
        Ok(_) => panic!("startup should fail"),
    }
}

#[tokio::test]
async fn invalid_config_aborts_startup() {
    let mut config = test_config();
    config.auth.signing_secret = "short".into();

    let result = builder(config, &Stores::default()).build().await;
    assert!(matches!(result, Err(StartupError::Config(_))));
}
