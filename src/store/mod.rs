//! Counter store adapters.
//!
//! All shared, cross-request state lives in a TTL-capable key-value store
//! with sorted-set operations. The [`CounterStore`] trait is the only seam
//! the limiter and the abuse detector talk through.

mod backend;
mod memory;
mod redis_store;

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

pub use backend::{admit_sequential, AdmitRequest, CounterStore, WindowState};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Errors raised while talking to the counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Run a store operation under a deadline.
///
/// An elapsed deadline is reported as [`StoreError::Timeout`] so callers can
/// treat it exactly like any other store failure.
pub async fn bounded<T, F>(timeout: Duration, op: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// Current wall-clock time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Build a set member for a timestamp entry.
///
/// Two requests landing on the same timestamp must both be counted, so the
/// member carries a random suffix.
pub fn unique_member(timestamp: f64) -> String {
    format!("{:.6}-{}", timestamp, Uuid::new_v4().simple())
}
