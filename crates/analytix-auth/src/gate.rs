//! Credential validation.
//!
//! [`AuthGate`] is the single entry point for turning a presented bearer
//! credential into a [`Principal`]. Signature and expiry are always checked;
//! there is no configuration that disables either.

use time::OffsetDateTime;

use crate::error::AuthError;
use crate::principal::Principal;
use crate::token::jwt::{JwtError, JwtService};

#[derive(Debug)]
pub struct AuthGate {
    jwt: JwtService,
}

impl AuthGate {
    #[must_use]
    pub fn new(jwt: JwtService) -> Self {
        Self { jwt }
    }

    /// Builds a gate from raw settings.
    ///
    /// # Errors
    /// Returns `AuthError::Internal` when the secret is unusable.
    pub fn from_secret(
        secret: &[u8],
        issuer: Option<String>,
        leeway_secs: u64,
    ) -> Result<Self, AuthError> {
        Ok(Self::new(JwtService::new(secret, issuer, leeway_secs)?))
    }

    #[must_use]
    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    /// Validates `credential` against the current time.
    pub fn validate(&self, credential: &str) -> Result<Principal, AuthError> {
        self.validate_at(credential, OffsetDateTime::now_utc())
    }

    /// Validates `credential` as of `now`.
    ///
    /// The decoder already rejects expired tokens, but only with its own
    /// clock; `exp` is checked again against `now` so the configured leeway
    /// is the only slack ever granted.
    pub fn validate_at(&self, credential: &str, now: OffsetDateTime) -> Result<Principal, AuthError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let claims = self
            .jwt
            .decode(credential)
            .map_err(|e| {
                tracing::debug!(error = %e, "credential rejected");
                AuthError::from(e)
            })?
            .claims;

        let leeway = i64::try_from(self.jwt.leeway_secs()).unwrap_or(i64::MAX);
        if claims.exp.saturating_add(leeway) <= now.unix_timestamp() {
            return Err(AuthError::from(JwtError::Expired));
        }
        if claims.sub.trim().is_empty() {
            return Err(AuthError::invalid_claims("empty subject"));
        }

        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|e| AuthError::invalid_claims(format!("exp out of range: {e}")))?;

        Ok(Principal::new(claims.sub, claims.roles, expires_at))
    }
}
