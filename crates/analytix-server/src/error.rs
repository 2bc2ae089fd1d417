//! Server error types.
//!
//! [`ApiError`] is what request handling turns into a response;
//! [`StartupError`] aborts the process before it accepts connections.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;

use analytix_auth::AuthError;

use crate::cache::CacheError;
use crate::hub::HubError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("rate limit of {limit} requests exceeded")]
    RateLimited { retry_after: Duration, limit: u64 },

    #[error("request deadline exceeded")]
    Timeout,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(AuthError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            Self::Auth(AuthError::Internal { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
            Self::Auth(e) => e.code(),
        }
    }
}

/// Whole seconds, rounded up, never below one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Auth(e) = self {
            // Carries its own challenge headers.
            return e.into_response();
        }

        let status = self.status();
        // Internal details stay in the logs.
        let message = match &self {
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let mut body = json!({ "error": self.code(), "message": message });
        let mut retry_after = None;
        if let Self::RateLimited { retry_after: after, .. } = &self {
            let secs = retry_after_secs(*after);
            body["retry_after"] = json!(secs);
            retry_after = Some(secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Cancelled => Self::Timeout,
            CacheError::Compute(source) => Self::Unavailable(source.to_string()),
            CacheError::Codec(message) | CacheError::Store(message) => Self::Internal(message),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::ShuttingDown | HubError::Closed => Self::Unavailable(err.to_string()),
            HubError::TooManyTopics { .. } => Self::BadRequest(err.to_string()),
            HubError::UnknownConnection(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<analytix_core::CoreError> for ApiError {
    fn from(err: analytix_core::CoreError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

/// Fatal errors raised before the server starts serving.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{store} is unreachable: {source}")]
    Probe {
        store: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to connect to {store}: {source}")]
    Connect {
        store: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("auth setup failed: {0}")]
    Auth(#[from] AuthError),
}
