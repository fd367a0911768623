//! Counter store trait for abstracting the in-process and Redis backends.

use async_trait::async_trait;

use super::StoreResult;

/// Inputs for one sliding-window admission against the store.
#[derive(Debug, Clone)]
pub struct AdmitRequest<'a> {
    /// Store key of the window
    pub key: &'a str,
    /// Entries with a score at or below this are expired
    pub cutoff: f64,
    /// Timestamp of the request being admitted
    pub now: f64,
    /// Set member recorded for the request when admitted
    pub member: &'a str,
    /// Maximum entries allowed in the window
    pub limit: u64,
    /// Store-level expiry refreshed on admission
    pub ttl_seconds: u64,
}

/// State of a window after an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowState {
    /// The request was recorded; `count_before` entries were already live.
    Admitted { count_before: u64 },
    /// The window is saturated; nothing was recorded.
    Full { count: u64, oldest: Option<f64> },
}

/// Trait for counter store implementations.
///
/// Every operation is a potential network round trip. Callers must not hold
/// an in-process lock across any of them.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `member` to the sorted set at `key` with `score`, replacing its
    /// score if it is already present.
    async fn add(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Remove every member scored at or below `cutoff`. Returns how many went.
    async fn prune(&self, key: &str, cutoff: f64) -> StoreResult<u64>;

    /// Number of members at `key`.
    async fn count(&self, key: &str) -> StoreResult<u64>;

    /// Number of members scored within `[min, max]`.
    async fn count_range(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Lowest score at `key`, if any.
    async fn oldest(&self, key: &str) -> StoreResult<Option<f64>>;

    /// The `n` highest scores at `key`, in ascending order.
    async fn latest(&self, key: &str, n: usize) -> StoreResult<Vec<f64>>;

    /// Drop all but the `keep` highest-scored members.
    async fn trim_to_latest(&self, key: &str, keep: usize) -> StoreResult<()>;

    /// Set the key's expiry.
    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<()>;

    /// Delete the key outright.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Prune, count, and either report the window as full or record the
    /// request and refresh the expiry.
    ///
    /// The default runs the primitives one after another, so concurrent
    /// admissions on the same key may overshoot the limit by the number of
    /// racing requests. Backends able to do better override it.
    async fn admit(&self, request: &AdmitRequest<'_>) -> StoreResult<WindowState> {
        admit_sequential(self, request).await
    }
}

/// Non-atomic admission built from the store primitives.
pub async fn admit_sequential<S>(store: &S, request: &AdmitRequest<'_>) -> StoreResult<WindowState>
where
    S: CounterStore + ?Sized,
{
    store.prune(request.key, request.cutoff).await?;
    let count = store.count(request.key).await?;

    if count >= request.limit {
        let oldest = store.oldest(request.key).await?;
        return Ok(WindowState::Full { count, oldest });
    }

    store.add(request.key, request.member, request.now).await?;
    store.expire(request.key, request.ttl_seconds).await?;
    Ok(WindowState::Admitted {
        count_before: count,
    })
}
