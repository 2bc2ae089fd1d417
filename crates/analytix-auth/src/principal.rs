//! The caller identity attached to an authenticated request.

use std::collections::BTreeSet;

use time::OffsetDateTime;

/// Caller identity derived from a validated credential.
///
/// Lives in request extensions for one request and is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Subject id (`sub` claim).
    pub subject: String,
    /// Granted roles.
    pub roles: BTreeSet<String>,
    /// When the credential stops being valid.
    pub expires_at: OffsetDateTime,
}

impl Principal {
    pub fn new<I, R>(subject: impl Into<String>, roles: I, expires_at: OffsetDateTime) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            subject: subject.into(),
            roles: roles.into_iter().map(Into::into).collect(),
            expires_at,
        }
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    #[must_use]
    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|r| self.roles.contains(*r))
    }
}
