//! Authentication and authorization error types.

use crate::token::jwt::JwtError;

/// Errors produced while establishing or checking a caller's identity.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("Missing credential")]
    MissingCredential,

    /// The credential could not be parsed as a token.
    #[error("Malformed credential: {message}")]
    Malformed {
        /// Description of the parse failure.
        message: String,
    },

    /// The credential signature does not verify.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The credential has expired.
    #[error("Credential expired")]
    Expired,

    /// The credential is signed and current but its claims are unacceptable.
    #[error("Invalid claims: {message}")]
    InvalidClaims {
        /// Description of the rejected claim.
        message: String,
    },

    /// The caller is authenticated but lacks a required role.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Description of why access is forbidden.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `Malformed` error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidClaims` error.
    #[must_use]
    pub fn invalid_claims(message: impl Into<String>) -> Self {
        Self::InvalidClaims {
            message: message.into(),
        }
    }

    /// Creates a new `Forbidden` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Machine-readable code used in response bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Malformed { .. } => "invalid_token",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::InvalidClaims { .. } => "invalid_claims",
            Self::Forbidden { .. } => "forbidden",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Returns `true` if the caller failed to authenticate (as opposed to
    /// being authenticated but denied).
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        !matches!(self, Self::Forbidden { .. } | Self::Internal { .. })
    }
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => Self::Expired,
            JwtError::InvalidSignature => Self::InvalidSignature,
            JwtError::Malformed { message } => Self::Malformed { message },
            JwtError::InvalidClaims { message } => Self::InvalidClaims { message },
            JwtError::EncodingError { message } | JwtError::InvalidKey { message } => {
                Self::Internal { message }
            }
        }
    }
}
