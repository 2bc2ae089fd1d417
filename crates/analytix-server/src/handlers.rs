use std::future::Future;
use std::time::Duration;

use analytix_auth::{AuthError, CurrentPrincipal, bearer_token, query_token};
use analytix_core::{AnalyticsEvent, Timestamp, now_utc};
use axum::{
    Extension, Json,
    extract::{Path, State, WebSocketUpgrade, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};

use crate::cache::ReadOptions;
use crate::error::ApiError;
use crate::hub::serve_connection;
use crate::pipeline::RequestDeadline;
use crate::server::AppState;
use crate::store::StoreError;

/// Roles allowed to publish events.
const PUBLISHER_ROLES: &[&str] = &["publisher", "admin"];

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: Timestamp,
    pub service: &'static str,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        timestamp: now_utc(),
        service: "analytix",
    })
}

/// Probes every store; 503 when any of them fails.
pub async fn ready(State(state): State<AppState>) -> Response {
    let postgres_timeout = state.config.storage.postgres.connect_timeout();
    let redis_timeout = state.config.redis.timeout();
    let (documents, cache, counters) = tokio::join!(
        probe(state.documents.ping(), postgres_timeout),
        probe(state.cache_store.ping(), redis_timeout),
        probe(state.counters.ping(), redis_timeout),
    );

    let ready = documents.is_ok() && cache.is_ok() && counters.is_ok();
    let describe = |r: &Result<(), String>| match r {
        Ok(()) => json!("ok"),
        Err(e) => json!({ "error": e }),
    };
    let body = json!({
        "status": if ready { "ready" } else { "unavailable" },
        "timestamp": now_utc(),
        "checks": {
            "document_store": describe(&documents),
            "cache_store": describe(&cache),
            "counter_store": describe(&counters),
        }
    });

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn probe(
    check: impl Future<Output = Result<(), StoreError>>,
    timeout: Duration,
) -> Result<(), String> {
    match tokio::time::timeout(timeout, check).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err("timed out".to_string()),
    }
}

pub async fn prometheus_metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

/// `GET /ws/analytics`: authenticates at connect, then hands the socket to
/// a tracked connection task.
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let validated = match bearer_token(&headers).or_else(|| query_token(&uri)) {
        Some(token) => state.gate.validate(token),
        None => Err(AuthError::MissingCredential),
    };
    let principal = match validated {
        Ok(principal) => principal,
        Err(e) => return e.into_response(),
    };

    let subscription = match state.hub.register(principal.subject).await {
        Ok(subscription) => subscription,
        Err(e) => return ApiError::from(e).into_response(),
    };

    // Counted from here so shutdown also waits for upgrades in progress.
    let tracked = state.hub.tracker().token();
    ws.on_upgrade(move |socket| async move {
        let _tracked = tracked;
        serve_connection(socket, subscription).await;
    })
}

/// `POST /api/v1/analytics/events`: validates and fans out one event.
pub async fn publish_event(
    State(state): State<AppState>,
    CurrentPrincipal(principal): CurrentPrincipal,
    body: Result<Json<AnalyticsEvent>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    if !principal.has_any_role(PUBLISHER_ROLES) {
        return Err(AuthError::forbidden("publishing events requires the publisher role").into());
    }
    let Json(event) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    event.validate()?;

    let delivered = state.hub.broadcast(&event).await?;
    tracing::debug!(
        topic = %event.topic,
        event_type = %event.event_type,
        subject = %principal.subject,
        delivered,
        "event published"
    );
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}

fn document_key(collection: &str, id: &str) -> String {
    format!("doc:{collection}:{id}")
}

/// `GET /api/v1/analytics/documents/{collection}/{id}`: cache-aside read.
///
/// Absent documents are cached too, so a hot miss does not reach the store
/// on every request.
pub async fn read_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Extension(deadline): Extension<RequestDeadline>,
) -> Result<Json<Value>, ApiError> {
    let documents = state.documents.clone();
    let (c, i) = (collection.clone(), id.clone());
    let compute = move || async move { documents.find(&c, &i).await };

    let document: Option<Value> = state
        .cache
        .get_until(
            &document_key(&collection, &id),
            ReadOptions::ttl(state.config.cache.default_ttl()),
            deadline.token(),
            compute,
        )
        .await?;

    document
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("document {collection}/{id}")))
}

/// `DELETE /api/v1/admin/cache/documents/{collection}/{id}`: drops the
/// cached copy after an out-of-band write.
pub async fn invalidate_document(
    State(state): State<AppState>,
    CurrentPrincipal(principal): CurrentPrincipal,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if !principal.has_role("admin") {
        return Err(AuthError::forbidden("cache invalidation requires the admin role").into());
    }
    state
        .cache
        .invalidate(&document_key(&collection, &id))
        .await?;
    tracing::info!(collection = %collection, id = %id, subject = %principal.subject, "document cache invalidated");
    Ok(StatusCode::NO_CONTENT)
}
