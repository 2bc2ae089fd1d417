//! Fixed-window rate limiting over a shared counter store.
//!
//! Each `(route class, caller)` pair owns one counter per window. The
//! increment and the first-increment expiry happen in one atomic store
//! operation, so every instance sharing the store sees the same count and
//! no increment can reset another's window timer.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics;
use crate::store::{CounterStore, StoreError};

/// Behaviour when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and flag the decision as degraded.
    FailOpen,
    /// Reject the request, asking the caller to retry shortly.
    FailClosed,
}

/// Retry hint returned when the store is down and the policy is fail-closed.
const FAIL_CLOSED_RETRY: Duration = Duration::from_secs(1);

/// Upper bound on one counter round trip unless configured otherwise.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Time until the window resets; zero when admitted.
    pub retry_after: Duration,
    /// The store was unreachable and the configured policy decided.
    pub degraded: bool,
}

/// Route tiers with separate budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Public,
    Authenticated,
    Admin,
    /// Credential issuance; the tightest budget.
    Critical,
}

impl RouteClass {
    /// Classifies a request path. Returns `None` for paths that are never
    /// rate limited (probes and metrics scraping).
    pub fn classify(path: &str) -> Option<Self> {
        match path {
            "/health" | "/ready" | "/metrics" => None,
            p if p.starts_with("/api/v1/auth/") || p == "/api/v1/auth" => Some(Self::Critical),
            p if p.starts_with("/api/v1/admin/") || p == "/api/v1/admin" => Some(Self::Admin),
            p if p.starts_with("/api/v1/") || p.starts_with("/ws/") => Some(Self::Authenticated),
            _ => Some(Self::Public),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Authenticated => "authenticated",
            Self::Admin => "admin",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policy: FailurePolicy,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: FailurePolicy) -> Self {
        Self {
            store,
            policy,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// A counter call slower than `timeout` counts as a store failure.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Counts one request against `key` and decides whether it is admitted.
    ///
    /// Exactly `limit` requests are admitted per window; the rest are
    /// rejected with the time left until the window resets.
    pub async fn allow(&self, key: &str, limit: u64, window: Duration) -> Decision {
        let counted = tokio::time::timeout(self.store_timeout, self.store.incr_window(key, window))
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::unavailable(format!(
                    "no response within {}ms",
                    self.store_timeout.as_millis()
                )))
            });
        match counted {
            Ok(counted) => {
                let admitted = counted.count <= limit;
                Decision {
                    admitted,
                    limit,
                    remaining: limit.saturating_sub(counted.count),
                    retry_after: if admitted {
                        Duration::ZERO
                    } else {
                        counted.ttl.min(window)
                    },
                    degraded: false,
                }
            }
            Err(e) => {
                metrics::record_rate_limit_store_error();
                let admitted = self.policy == FailurePolicy::FailOpen;
                tracing::warn!(
                    key = %key,
                    error = %e,
                    admitted,
                    "rate limit store unavailable"
                );
                Decision {
                    admitted,
                    limit,
                    remaining: if admitted { limit } else { 0 },
                    retry_after: if admitted {
                        Duration::ZERO
                    } else {
                        FAIL_CLOSED_RETRY
                    },
                    degraded: true,
                }
            }
        }
    }
}

/// Builds the counter key for a caller in a route class.
pub fn rate_key(prefix: &str, class: RouteClass, caller: &str) -> String {
    format!("{prefix}:rl:{}:{caller}", class.as_str())
}
