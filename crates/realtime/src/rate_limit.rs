use std::sync::Arc;

use coordination::{keys, now_ms, CoordinationStore, StoreError};
use tracing::debug;

use crate::{config::Limit, error::RealtimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the oldest attempt leaves the window. Zero when allowed.
    pub retry_after_ms: u64,
}

/// Sliding-window limiter. Each check is one atomic store operation, so two
/// concurrent callers can never both squeeze in past the limit.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        scope: &str,
        key: &str,
        limit: Limit,
    ) -> Result<RateDecision, StoreError> {
        let now = now_ms();
        let window = self
            .store
            .record_hit(&keys::rate_limit(scope, key), now, limit.window)
            .await?;
        let count = u32::try_from(window.count).unwrap_or(u32::MAX);
        if count <= limit.max {
            return Ok(RateDecision {
                allowed: true,
                remaining: limit.max - count,
                retry_after_ms: 0,
            });
        }
        let window_ms = u64::try_from(limit.window.as_millis()).unwrap_or(u64::MAX);
        let age = u64::try_from(now.saturating_sub(window.oldest_ms)).unwrap_or(0);
        let retry_after_ms = window_ms.saturating_sub(age).max(1);
        debug!(scope, key, count, retry_after_ms, "rate limit exceeded");
        Ok(RateDecision {
            allowed: false,
            remaining: 0,
            retry_after_ms,
        })
    }

    /// `check` that turns a rejection into [`RealtimeError::RateLimited`].
    pub async fn enforce(&self, scope: &str, key: &str, limit: Limit) -> Result<(), RealtimeError> {
        let decision = self.check(scope, key, limit).await?;
        if decision.allowed {
            Ok(())
        } else {
            Err(RealtimeError::RateLimited {
                retry_after_ms: decision.retry_after_ms,
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/rate_limit_tests.rs"]
mod tests;
