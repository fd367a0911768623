//! Store-backed abuse detector.
//!
//! Keeps three auxiliary sorted sets per subject, separate from the rate
//! limit windows:
//!
//! - `freq_check:<subject>`: one entry per request, trimmed to the frequency window
//! - `pattern:<subject>`: one entry per request, trimmed to the latest samples
//! - `endpoints:<subject>`: one entry per endpoint class, scored by last access

use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use super::heuristics::{classify, AbuseSnapshot, AbuseThresholds, AbuseVerdict};
use crate::ratelimit::{Subject, DEFAULT_STORE_TIMEOUT};
use crate::store::{bounded, unique_member, unix_now, CounterStore, StoreResult};

/// Records request history and evaluates it for automation.
#[derive(Clone)]
pub struct AbuseDetector {
    store: Arc<dyn CounterStore>,
    thresholds: AbuseThresholds,
    timeout: Duration,
}

impl AbuseDetector {
    pub fn new(store: Arc<dyn CounterStore>, thresholds: AbuseThresholds) -> Self {
        Self::with_timeout(store, thresholds, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(
        store: Arc<dyn CounterStore>,
        thresholds: AbuseThresholds,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            thresholds,
            timeout,
        }
    }

    pub fn thresholds(&self) -> &AbuseThresholds {
        &self.thresholds
    }

    /// Record a request at the current time.
    pub async fn record(&self, subject: &Subject, endpoint_class: &str) -> StoreResult<()> {
        self.record_at(subject, endpoint_class, unix_now()).await
    }

    /// Record a request made by `subject` to `endpoint_class` at `now`.
    pub async fn record_at(
        &self,
        subject: &Subject,
        endpoint_class: &str,
        now: f64,
    ) -> StoreResult<()> {
        let t = &self.thresholds;
        let frequency_key = frequency_key(subject);
        let pattern_key = pattern_key(subject);
        let endpoints_key = endpoints_key(subject);

        let frequency = async {
            self.store
                .add(&frequency_key, &unique_member(now), now)
                .await?;
            self.store
                .prune(&frequency_key, now - t.frequency_window_secs as f64)
                .await?;
            self.store
                .expire(&frequency_key, t.frequency_window_secs)
                .await
        };

        let pattern = async {
            self.store.add(&pattern_key, &unique_member(now), now).await?;
            self.store
                .trim_to_latest(&pattern_key, t.pattern_samples)
                .await?;
            self.store.expire(&pattern_key, t.scan_window_secs).await
        };

        let endpoints = async {
            self.store.add(&endpoints_key, endpoint_class, now).await?;
            self.store
                .prune(&endpoints_key, now - t.scan_window_secs as f64)
                .await?;
            self.store.expire(&endpoints_key, t.scan_window_secs).await
        };

        trace!(subject = %subject, endpoint_class = %endpoint_class, "Recording request history");

        bounded(self.timeout, async {
            futures::try_join!(frequency, pattern, endpoints).map(|_| ())
        })
        .await
    }

    /// Evaluate a subject at the current time.
    pub async fn evaluate(&self, subject: &Subject) -> StoreResult<AbuseVerdict> {
        self.evaluate_at(subject, unix_now()).await
    }

    /// Gather the subject's history as of `now` and classify it.
    pub async fn evaluate_at(&self, subject: &Subject, now: f64) -> StoreResult<AbuseVerdict> {
        let snapshot = self.snapshot_at(subject, now).await?;
        let verdict = classify(&snapshot, &self.thresholds);

        if verdict.is_suspicious {
            warn!(
                subject = %subject,
                signals = ?verdict.signals,
                recent_requests = snapshot.recent_requests,
                distinct_endpoints = snapshot.distinct_endpoints,
                "Suspicious activity detected"
            );
        }

        Ok(verdict)
    }

    /// Read the counts the heuristics work on.
    pub async fn snapshot_at(&self, subject: &Subject, now: f64) -> StoreResult<AbuseSnapshot> {
        let t = &self.thresholds;
        let frequency_key = frequency_key(subject);
        let pattern_key = pattern_key(subject);
        let endpoints_key = endpoints_key(subject);

        let (recent_requests, recent_timestamps, distinct_endpoints) = bounded(
            self.timeout,
            async {
                futures::try_join!(
                    self.store.count_range(
                        &frequency_key,
                        now - t.frequency_window_secs as f64,
                        now
                    ),
                    self.store.latest(&pattern_key, t.pattern_samples),
                    self.store
                        .count_range(&endpoints_key, now - t.scan_window_secs as f64, now),
                )
            },
        )
        .await?;

        Ok(AbuseSnapshot {
            recent_requests,
            recent_timestamps,
            distinct_endpoints,
        })
    }
}

fn frequency_key(subject: &Subject) -> String {
    format!("freq_check:{}", subject)
}

fn pattern_key(subject: &Subject) -> String {
    format!("pattern:{}", subject)
}

fn endpoints_key(subject: &Subject) -> String {
    format!("endpoints:{}", subject)
}
