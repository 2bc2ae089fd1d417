//! Outermost stage: turns a panic anywhere below into a 500.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;

use super::{Next, Stage, X_REQUEST_ID, ensure_request_id};
use crate::error::ApiError;

pub struct RecoveryStage;

#[async_trait]
impl Stage for RecoveryStage {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn apply(&self, mut request: Request, next: Next<'_>) -> Response {
        let request_id = ensure_request_id(&mut request);
        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        match AssertUnwindSafe(next.run(request)).catch_unwind().await {
            Ok(response) => response,
            Err(panic) => {
                tracing::error!(
                    method = %method,
                    path = %path,
                    request_id = %request_id.as_str(),
                    panic = %panic_message(panic.as_ref()),
                    "request handler panicked"
                );
                let mut response =
                    ApiError::internal(format!("panic while handling {method} {path}"))
                        .into_response();
                response.headers_mut().insert(X_REQUEST_ID, request_id.0);
                response
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
