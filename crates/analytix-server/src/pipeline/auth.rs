use std::sync::Arc;

use analytix_auth::{AuthError, AuthGate, bearer_token};
use async_trait::async_trait;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};

use super::{Next, Stage};

/// Rejects requests without a valid bearer credential and attaches the
/// caller's [`Principal`](analytix_auth::Principal) otherwise.
pub struct AuthStage {
    gate: Arc<AuthGate>,
}

impl AuthStage {
    pub fn new(gate: Arc<AuthGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn apply(&self, mut request: Request, next: Next<'_>) -> Response {
        let validated = match bearer_token(request.headers()) {
            Some(token) => self.gate.validate(token),
            None => Err(AuthError::MissingCredential),
        };

        match validated {
            Ok(principal) => {
                tracing::debug!(subject = %principal.subject, "caller authenticated");
                request.extensions_mut().insert(principal);
                next.run(request).await
            }
            Err(e) => {
                tracing::debug!(
                    path = %request.uri().path(),
                    error = %e,
                    "credential rejected"
                );
                e.into_response()
            }
        }
    }
}
