//! Redis-backed counter store.
//!
//! Sorted sets hold one member per recorded request, scored by its Unix
//! timestamp. All keys are namespaced so several deployments can share one
//! Redis instance.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use super::backend::{admit_sequential, AdmitRequest, CounterStore, WindowState};
use super::StoreResult;

/// Prune, count and conditionally record in a single server-side step.
///
/// Returns `{admitted, count, oldest}` where `oldest` is the lowest score as a
/// string (Lua numbers would be truncated to integers on the way out) or an
/// empty string when the window is empty.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local cutoff = ARGV[1]
local now = tonumber(ARGV[2])
local member = ARGV[3]
local limit = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)
local count = redis.call('ZCARD', key)

if count >= limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    if oldest[2] then
        return {0, count, oldest[2]}
    end
    return {0, count, ''}
end

redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, ttl)
return {1, count, ''}
"#;

/// Counter store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
    atomic: bool,
    admit_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.namespace)
            .field("atomic", &self.atomic)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// With `atomic` set, admissions run as one Lua script instead of a
    /// sequence of commands.
    pub async fn connect(url: &str, namespace: &str, atomic: bool) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(namespace = %namespace, atomic = atomic, "Connected to Redis counter store");

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
            atomic,
            admit_script: Script::new(ADMIT_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        namespaced(&self.namespace, key)
    }

    async fn admit_atomic(&self, request: &AdmitRequest<'_>) -> StoreResult<WindowState> {
        let mut conn = self.conn.clone();
        let (admitted, count, oldest): (i64, u64, String) = self
            .admit_script
            .key(self.key(request.key))
            .arg(request.cutoff)
            .arg(request.now)
            .arg(request.member)
            .arg(request.limit)
            .arg(request.ttl_seconds)
            .invoke_async(&mut conn)
            .await?;

        if admitted == 1 {
            Ok(WindowState::Admitted {
                count_before: count,
            })
        } else {
            Ok(WindowState::Full {
                count,
                oldest: oldest.parse().ok(),
            })
        }
    }
}

fn namespaced(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", namespace, key)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(self.key(key))
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn prune(&self, key: &str, cutoff: f64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.key(key))
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCARD")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count_range(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(self.key(key))
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn oldest(&self, key: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.conn.clone();
        let first: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.key(key))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(first.first().map(|(_, score)| *score))
    }

    async fn latest(&self, key: &str, n: usize) -> StoreResult<Vec<f64>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let tail: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.key(key))
            .arg(-(n as i64))
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(tail.into_iter().map(|(_, score)| score).collect())
    }

    async fn trim_to_latest(&self, key: &str, keep: usize) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZREMRANGEBYRANK")
            .arg(self.key(key))
            .arg(0)
            .arg(-(keep as i64) - 1)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("EXPIRE")
            .arg(self.key(key))
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn admit(&self, request: &AdmitRequest<'_>) -> StoreResult<WindowState> {
        if self.atomic {
            self.admit_atomic(request).await
        } else {
            admit_sequential(self, request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Policy, PolicySpec, RateLimitKey, SlidingWindowLimiter, Subject};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_namespaced_key() {
        assert_eq!(
            namespaced("turnstile", "rate_limit:picks_list:ip:10.0.0.1"),
            "turnstile:rate_limit:picks_list:ip:10.0.0.1"
        );
        assert_eq!(namespaced("", "pattern:user:42"), "pattern:user:42");
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = RedisStore::connect("not a url", "turnstile", false).await;
        tokio_test::assert_err!(result);
    }

    // The tests below need a live server:
    //   REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored

    const T0: f64 = 1_700_000_000.0;

    /// Connect under a fresh namespace so runs never see each other's keys.
    async fn live_store(atomic: bool) -> RedisStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let namespace = format!("turnstile-test-{}", uuid::Uuid::new_v4().simple());
        RedisStore::connect(&url, &namespace, atomic)
            .await
            .expect("REDIS_URL must point at a running Redis server")
    }

    async fn run_picks_generation_scenario(atomic: bool) {
        let store = Arc::new(live_store(atomic).await);
        let limiter = SlidingWindowLimiter::with_timeout(store, Duration::from_millis(500));
        let policy = Policy::new("picks_generation", "5/minute".parse::<PolicySpec>().unwrap());
        let key = RateLimitKey::new(Subject::User("42".to_string()), "picks_generation");

        for (t, remaining) in [(0.0, 4), (1.0, 3), (2.0, 2), (3.0, 1), (4.0, 0)] {
            let verdict = limiter.check_at(&key, &policy, T0 + t).await;
            assert!(!verdict.degraded, "store failed at t={}", t);
            assert!(verdict.allowed);
            assert_eq!(verdict.remaining, remaining);
        }

        let denied = limiter.check_at(&key, &policy, T0 + 5.0).await;
        assert!(!denied.degraded);
        assert!(!denied.allowed);
        assert_eq!(denied.current_count, 5);
        assert_eq!(denied.reset_seconds, 55);

        let recovered = limiter.check_at(&key, &policy, T0 + 61.0).await;
        assert!(recovered.allowed);
        assert_eq!(recovered.current_count, 1);

        limiter.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_scenario_with_atomic_admission() {
        run_picks_generation_scenario(true).await;
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_scenario_with_sequential_admission() {
        run_picks_generation_scenario(false).await;
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_atomic_and_sequential_admission_agree() {
        let atomic = live_store(true).await;
        let sequential = live_store(false).await;

        for (i, now) in [100.0, 100.5, 101.25, 102.0, 170.0].iter().enumerate() {
            let member = format!("m{}", i);
            let request = AdmitRequest {
                key: "window",
                cutoff: now - 60.0,
                now: *now,
                member: &member,
                limit: 3,
                ttl_seconds: 60,
            };
            let a = atomic.admit(&request).await.unwrap();
            let b = sequential.admit(&request).await.unwrap();
            assert_eq!(a, b, "diverged at t={}", now);
        }

        // A full window reports its oldest score without truncation.
        let request = AdmitRequest {
            key: "full",
            cutoff: 0.0,
            now: 10.0,
            member: "x",
            limit: 0,
            ttl_seconds: 60,
        };
        atomic.add("full", "first", 7.25).await.unwrap();
        assert_eq!(
            atomic.admit(&request).await.unwrap(),
            WindowState::Full {
                count: 1,
                oldest: Some(7.25)
            }
        );

        atomic.delete("window").await.unwrap();
        atomic.delete("full").await.unwrap();
        sequential.delete("window").await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_sorted_set_reads_and_trim() {
        let store = live_store(false).await;
        for i in 0..12 {
            store.add("pattern", &format!("m{}", i), 10.0 + i as f64 * 0.5).await.unwrap();
        }

        assert_eq!(store.oldest("pattern").await.unwrap(), Some(10.0));
        assert_eq!(store.latest("pattern", 3).await.unwrap(), vec![14.5, 15.0, 15.5]);
        assert_eq!(store.count_range("pattern", 11.0, 12.0).await.unwrap(), 3);

        store.trim_to_latest("pattern", 10).await.unwrap();
        assert_eq!(store.count("pattern").await.unwrap(), 10);
        assert_eq!(store.oldest("pattern").await.unwrap(), Some(11.0));

        assert_eq!(store.prune("pattern", 12.0).await.unwrap(), 3);
        assert_eq!(store.count("pattern").await.unwrap(), 7);
        assert_eq!(store.latest("empty", 3).await.unwrap(), Vec::<f64>::new());
        assert_eq!(store.oldest("empty").await.unwrap(), None);

        store.delete("pattern").await.unwrap();
        assert_eq!(store.count("pattern").await.unwrap(), 0);
    }
}
