//! Sliding-log rate limiter.
//!
//! Every admitted request is recorded as a timestamped entry in the window's
//! sorted set. Entries older than the window are pruned before counting, so
//! no trailing interval of `window_seconds` ever holds more than `limit`
//! admitted requests (up to the overshoot of racing non-atomic admissions).

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

use super::policy::{FailureMode, Policy};
use super::subject::RateLimitKey;
use crate::store::{
    bounded, unique_member, unix_now, AdmitRequest, CounterStore, StoreResult, WindowState,
};

/// Default deadline for a single counter store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Estimated seconds until the oldest counted entry leaves the window
    pub reset_seconds: u64,
    pub current_count: u64,
    /// Set when the store failed and the failure mode decided the outcome
    #[serde(skip)]
    pub degraded: bool,
}

impl Verdict {
    /// Rate limit headers the routing layer attaches to its response.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_seconds.to_string()),
        ]
    }
}

/// The sliding-window limiter.
///
/// Holds no per-key state of its own; all counters live in the store, so
/// any number of instances sharing a store enforce the same limits.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl SlidingWindowLimiter {
    /// Create a limiter over `store` with the default store timeout.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_timeout(store, DEFAULT_STORE_TIMEOUT)
    }

    /// Create a limiter with an explicit store timeout.
    pub fn with_timeout(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Check and count a request against `policy` at the current time.
    pub async fn check(&self, key: &RateLimitKey, policy: &Policy) -> Verdict {
        self.check_at(key, policy, unix_now()).await
    }

    /// Check and count a request against `policy` at time `now` (Unix seconds).
    ///
    /// Never fails: store errors and timeouts resolve according to the
    /// policy's failure mode.
    pub async fn check_at(&self, key: &RateLimitKey, policy: &Policy, now: f64) -> Verdict {
        let store_key = key.store_key();
        let member = unique_member(now);
        let window = policy.window_seconds;

        let request = AdmitRequest {
            key: &store_key,
            cutoff: now - window as f64,
            now,
            member: &member,
            limit: policy.limit,
            ttl_seconds: window,
        };

        trace!(key = %store_key, limit = policy.limit, window = window, "Checking rate limit");

        match bounded(self.timeout, self.store.admit(&request)).await {
            Ok(WindowState::Admitted { count_before }) => Verdict {
                allowed: true,
                limit: policy.limit,
                remaining: policy.limit.saturating_sub(count_before + 1),
                reset_seconds: window,
                current_count: count_before + 1,
                degraded: false,
            },
            Ok(WindowState::Full { count, oldest }) => {
                let reset_seconds = match oldest {
                    Some(oldest) => (oldest + window as f64 - now).max(0.0) as u64,
                    // Emptied between count and read.
                    None => window,
                };

                debug!(
                    key = %store_key,
                    count = count,
                    limit = policy.limit,
                    reset_seconds = reset_seconds,
                    "Rate limit exceeded"
                );

                Verdict {
                    allowed: false,
                    limit: policy.limit,
                    remaining: 0,
                    reset_seconds,
                    current_count: count,
                    degraded: false,
                }
            }
            Err(e) => {
                error!(
                    key = %store_key,
                    error = %e,
                    failure_mode = ?policy.failure_mode,
                    "Counter store failure during rate limit check"
                );
                failure_verdict(policy)
            }
        }
    }

    /// Number of entries currently stored for a window, expired ones included
    /// until the next check prunes them.
    pub async fn current_count(&self, key: &RateLimitKey) -> StoreResult<u64> {
        bounded(self.timeout, self.store.count(&key.store_key())).await
    }

    /// Drop a window entirely.
    pub async fn reset(&self, key: &RateLimitKey) -> StoreResult<()> {
        debug!(key = %key, "Resetting rate limit window");
        bounded(self.timeout, self.store.delete(&key.store_key())).await
    }
}

fn failure_verdict(policy: &Policy) -> Verdict {
    match policy.failure_mode {
        FailureMode::Open => Verdict {
            allowed: true,
            limit: policy.limit,
            remaining: policy.limit,
            reset_seconds: policy.window_seconds,
            current_count: 0,
            degraded: true,
        },
        FailureMode::Closed => Verdict {
            allowed: false,
            limit: policy.limit,
            remaining: 0,
            reset_seconds: policy.window_seconds,
            current_count: 0,
            degraded: true,
        },
    }
}
