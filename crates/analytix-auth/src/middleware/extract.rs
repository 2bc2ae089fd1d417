//! Bearer credential extraction.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, Uri, header::AUTHORIZATION, request::Parts},
};

use crate::error::AuthError;
use crate::gate::AuthGate;
use crate::principal::Principal;

/// Returns the token from an `Authorization: Bearer <token>` header.
///
/// The scheme is matched case-insensitively. Returns `None` when the header
/// is absent, not UTF-8, uses another scheme, or carries an empty token.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Returns the `token` query parameter, used by WebSocket upgrades where
/// browsers cannot set headers.
pub fn query_token(uri: &Uri) -> Option<&str> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

// =============================================================================
// Bearer Auth Extractor
// =============================================================================

/// Axum extractor that validates the bearer header and yields the caller.
///
/// If an auth stage already attached a [`Principal`] to the request, that
/// one is reused instead of validating twice.
#[derive(Debug, Clone)]
pub struct BearerAuth(pub Principal);

impl<S> FromRequestParts<S> for BearerAuth
where
    S: Send + Sync,
    Arc<AuthGate>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(principal) = parts.extensions.get::<Principal>() {
            return Ok(Self(principal.clone()));
        }

        let gate = Arc::<AuthGate>::from_ref(state);
        let token = bearer_token(&parts.headers).ok_or(AuthError::MissingCredential)?;
        let principal = gate.validate(token)?;
        parts.extensions.insert(principal.clone());
        Ok(Self(principal))
    }
}

// =============================================================================
// Current Principal Extractor
// =============================================================================

/// Reads the [`Principal`] placed in request extensions by the auth stage.
///
/// Rejects with `MissingCredential` on routes that are not protected.
#[derive(Debug, Clone)]
pub struct CurrentPrincipal(pub Principal);

impl<S> FromRequestParts<S> for CurrentPrincipal
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(Self)
            .ok_or(AuthError::MissingCredential)
    }
}
