//! HTTP integration for authentication.
//!
//! - [`BearerAuth`] validates the `Authorization` header in a handler
//! - [`CurrentPrincipal`] reads the principal an auth stage already attached
//! - `IntoResponse` for [`AuthError`](crate::AuthError) renders 401/403/500
//!
//! # Example
//!
//! ```ignore
//! async fn whoami(CurrentPrincipal(principal): CurrentPrincipal) -> String {
//!     principal.subject
//! }
//! ```

pub mod error;
pub mod extract;

pub use extract::{BearerAuth, CurrentPrincipal, bearer_token, query_token};
