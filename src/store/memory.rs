//! In-process counter store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::backend::{AdmitRequest, CounterStore, WindowState};
use super::{StoreError, StoreResult};

/// Writes between full sweeps of expired keys.
pub const DEFAULT_SWEEP_INTERVAL: u64 = 1024;

/// A sorted set of `(score, member)` pairs with an optional deadline.
#[derive(Debug, Default)]
struct SortedSet {
    entries: Vec<(f64, String)>,
    expires_at: Option<Instant>,
}

impl SortedSet {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn insert(&mut self, member: &str, score: f64) {
        self.entries.retain(|(_, m)| m != member);
        let idx = self.entries.partition_point(|(s, _)| *s <= score);
        self.entries.insert(idx, (score, member.to_string()));
    }

    fn prune(&mut self, cutoff: f64) -> u64 {
        let expired = self.entries.partition_point(|(s, _)| *s <= cutoff);
        self.entries.drain(..expired);
        expired as u64
    }
}

/// Counter store kept in process memory.
///
/// Suitable for a single instance and for tests. Limits are not shared
/// between processes. Each key is locked for the duration of an admission,
/// so [`CounterStore::admit`] is atomic here.
pub struct MemoryStore {
    sets: DashMap<String, SortedSet>,
    available: AtomicBool,
    writes: AtomicU64,
    sweep_interval: u64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create an empty store that drops every expired key once per
    /// `interval` writes. Keys that are never touched again are otherwise
    /// held forever.
    pub fn with_sweep_interval(interval: u64) -> Self {
        Self {
            sets: DashMap::new(),
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
            sweep_interval: interval.max(1),
        }
    }

    /// Make every subsequent operation fail with [`StoreError::Unavailable`]
    /// (or succeed again), to exercise fail-open handling.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.sets.retain(|_, set| !set.is_expired());
        self.sets.len()
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    /// Must not be called while holding a reference into `sets`.
    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_interval == 0 {
            let before = self.sets.len();
            self.sets.retain(|_, set| !set.is_expired());
            let swept = before.saturating_sub(self.sets.len());
            if swept > 0 {
                debug!(swept = swept, "Swept expired keys");
            }
        }
    }

    fn evict_expired(&self, key: &str) {
        if self.sets.remove_if(key, |_, set| set.is_expired()).is_some() {
            debug!(key = %key, "Evicted expired key");
        }
    }

    fn read<T>(&self, key: &str, f: impl FnOnce(&SortedSet) -> T) -> StoreResult<Option<T>> {
        self.ensure_available()?;
        self.evict_expired(key);
        Ok(self.sets.get(key).map(|set| f(&set)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.ensure_available()?;
        self.record_write();
        self.evict_expired(key);
        self.sets.entry(key.to_string()).or_default().insert(member, score);
        Ok(())
    }

    async fn prune(&self, key: &str, cutoff: f64) -> StoreResult<u64> {
        self.ensure_available()?;
        self.evict_expired(key);
        Ok(self
            .sets
            .get_mut(key)
            .map(|mut set| set.prune(cutoff))
            .unwrap_or(0))
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        Ok(self.read(key, |set| set.entries.len() as u64)?.unwrap_or(0))
    }

    async fn count_range(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let counted = self.read(key, |set| {
            set.entries
                .iter()
                .filter(|(s, _)| *s >= min && *s <= max)
                .count() as u64
        })?;
        Ok(counted.unwrap_or(0))
    }

    async fn oldest(&self, key: &str) -> StoreResult<Option<f64>> {
        Ok(self
            .read(key, |set| set.entries.first().map(|(s, _)| *s))?
            .flatten())
    }

    async fn latest(&self, key: &str, n: usize) -> StoreResult<Vec<f64>> {
        let scores = self.read(key, |set| {
            let skip = set.entries.len().saturating_sub(n);
            set.entries[skip..].iter().map(|(s, _)| *s).collect::<Vec<f64>>()
        })?;
        Ok(scores.unwrap_or_default())
    }

    async fn trim_to_latest(&self, key: &str, keep: usize) -> StoreResult<()> {
        self.ensure_available()?;
        self.evict_expired(key);
        if let Some(mut set) = self.sets.get_mut(key) {
            let excess = set.entries.len().saturating_sub(keep);
            set.entries.drain(..excess);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<()> {
        self.ensure_available()?;
        self.evict_expired(key);
        if let Some(mut set) = self.sets.get_mut(key) {
            set.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.sets.remove(key);
        Ok(())
    }

    async fn admit(&self, request: &AdmitRequest<'_>) -> StoreResult<WindowState> {
        self.ensure_available()?;
        self.record_write();
        self.evict_expired(request.key);

        let mut set = self.sets.entry(request.key.to_string()).or_default();
        set.prune(request.cutoff);

        let count = set.entries.len() as u64;
        if count >= request.limit {
            let oldest = set.entries.first().map(|(s, _)| *s);
            return Ok(WindowState::Full { count, oldest });
        }

        set.insert(request.member, request.now);
        set.expires_at = Some(Instant::now() + Duration::from_secs(request.ttl_seconds));
        Ok(WindowState::Admitted {
            count_before: count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::admit_sequential;

    fn request<'a>(key: &'a str, member: &'a str, now: f64) -> AdmitRequest<'a> {
        AdmitRequest {
            key,
            cutoff: now - 60.0,
            now,
            member,
            limit: 2,
            ttl_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_add_keeps_scores_sorted() {
        let store = MemoryStore::new();
        store.add("k", "b", 20.0).await.unwrap();
        store.add("k", "a", 10.0).await.unwrap();
        store.add("k", "c", 30.0).await.unwrap();

        assert_eq!(store.count("k").await.unwrap(), 3);
        assert_eq!(store.oldest("k").await.unwrap(), Some(10.0));
        assert_eq!(store.latest("k", 2).await.unwrap(), vec![20.0, 30.0]);
    }

    #[tokio::test]
    async fn test_add_existing_member_updates_score() {
        let store = MemoryStore::new();
        store.add("k", "picks_list", 10.0).await.unwrap();
        store.add("k", "picks_list", 50.0).await.unwrap();

        assert_eq!(store.count("k").await.unwrap(), 1);
        assert_eq!(store.oldest("k").await.unwrap(), Some(50.0));
    }

    #[tokio::test]
    async fn test_prune_is_inclusive_of_cutoff() {
        let store = MemoryStore::new();
        for (i, score) in [1.0, 2.0, 3.0].iter().enumerate() {
            store.add("k", &i.to_string(), *score).await.unwrap();
        }

        assert_eq!(store.prune("k", 2.0).await.unwrap(), 2);
        assert_eq!(store.count("k").await.unwrap(), 1);
        assert_eq!(store.prune("missing", 2.0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_count_range_and_trim() {
        let store = MemoryStore::new();
        for i in 0..12 {
            store.add("k", &i.to_string(), i as f64).await.unwrap();
        }

        assert_eq!(store.count_range("k", 2.0, 5.0).await.unwrap(), 4);

        store.trim_to_latest("k", 10).await.unwrap();
        assert_eq!(store.count("k").await.unwrap(), 10);
        assert_eq!(store.oldest("k").await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn test_expired_key_is_dropped() {
        let store = MemoryStore::new();
        store.add("k", "m", 1.0).await.unwrap();
        store.expire("k", 0).await.unwrap();

        assert_eq!(store.count("k").await.unwrap(), 0);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_keys_are_swept_on_write() {
        let store = MemoryStore::with_sweep_interval(10);
        for i in 0..1000 {
            let key = format!("gone:{}", i);
            store.add(&key, "m", 1.0).await.unwrap();
            store.expire(&key, 0).await.unwrap();
        }
        for i in 0..10 {
            let key = format!("live:{}", i);
            store.add(&key, "m", 2.0).await.unwrap();
            store.expire(&key, 60).await.unwrap();
        }

        assert_eq!(store.sets.len(), 10);
        assert!(store.sets.iter().all(|entry| entry.key().starts_with("live:")));
    }

    #[tokio::test]
    async fn test_expire_does_not_revive_expired_key() {
        let store = MemoryStore::new();
        store.add("k", "stale", 1.0).await.unwrap();
        store.expire("k", 0).await.unwrap();

        store.expire("k", 60).await.unwrap();
        store.trim_to_latest("k", 10).await.unwrap();
        assert_eq!(store.count("k").await.unwrap(), 0);
        assert_eq!(store.oldest("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(
            store.count("k").await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert_eq!(store.count("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_admit_fills_then_reports_full() {
        let store = MemoryStore::new();

        let first = store.admit(&request("w", "m1", 100.0)).await.unwrap();
        assert_eq!(first, WindowState::Admitted { count_before: 0 });

        let second = store.admit(&request("w", "m2", 101.0)).await.unwrap();
        assert_eq!(second, WindowState::Admitted { count_before: 1 });

        let third = store.admit(&request("w", "m3", 102.0)).await.unwrap();
        assert_eq!(
            third,
            WindowState::Full {
                count: 2,
                oldest: Some(100.0)
            }
        );
    }

    #[tokio::test]
    async fn test_sequential_admit_matches_atomic_admit() {
        let store = MemoryStore::new();

        admit_sequential(&store, &request("w", "m1", 100.0)).await.unwrap();
        admit_sequential(&store, &request("w", "m2", 101.0)).await.unwrap();
        let state = admit_sequential(&store, &request("w", "m3", 102.0))
            .await
            .unwrap();

        assert_eq!(
            state,
            WindowState::Full {
                count: 2,
                oldest: Some(100.0)
            }
        );

        // Past the window, both entries are pruned.
        let state = admit_sequential(&store, &request("w", "m4", 161.5))
            .await
            .unwrap();
        assert_eq!(state, WindowState::Admitted { count_before: 0 });
    }
}
