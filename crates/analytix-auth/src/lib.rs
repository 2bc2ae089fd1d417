//! # analytix-auth
//!
//! Bearer credential validation for the Analytix service.
//!
//! ## Modules
//!
//! - [`token`] - HS256 token issuance and verification
//! - [`principal`] - The caller identity derived from a validated token
//! - [`gate`] - [`AuthGate`], the mandatory signature and expiry check
//! - [`middleware`] - Axum extractors and error responses

pub mod error;
pub mod gate;
pub mod middleware;
pub mod principal;
pub mod token;

pub use error::AuthError;
pub use gate::AuthGate;
pub use middleware::{BearerAuth, CurrentPrincipal, bearer_token, query_token};
pub use principal::Principal;
pub use token::jwt::{AccessTokenClaims, JwtError, JwtService, MIN_SECRET_LEN};
