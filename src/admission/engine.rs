//! The per-request admission entry point.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

use super::decision::{Decision, Denial, DenialReason};
use crate::abuse::{AbuseDetector, AbuseThresholds, AbuseVerdict};
use crate::config::{StoreBackend, TurnstileConfig};
use crate::error::Result;
use crate::ratelimit::{
    PolicyRegistry, RateLimitKey, RequestMeta, SlidingWindowLimiter, Subject, Verdict,
};
use crate::store::{unix_now, CounterStore, MemoryStore, RedisStore};

/// Decides whether each inbound request may proceed.
///
/// Stateless apart from the policy table; all counters live in the store.
pub struct AdmissionEngine {
    policies: RwLock<Arc<PolicyRegistry>>,
    limiter: SlidingWindowLimiter,
    detector: AbuseDetector,
}

impl AdmissionEngine {
    /// Create an engine over `store`.
    pub fn new(
        store: Arc<dyn CounterStore>,
        policies: PolicyRegistry,
        thresholds: AbuseThresholds,
        store_timeout: Duration,
    ) -> Self {
        Self {
            policies: RwLock::new(Arc::new(policies)),
            limiter: SlidingWindowLimiter::with_timeout(store.clone(), store_timeout),
            detector: AbuseDetector::with_timeout(store, thresholds, store_timeout),
        }
    }

    /// Build an engine from configuration, connecting to the configured store.
    pub async fn from_config(config: &TurnstileConfig) -> Result<Self> {
        let policies = PolicyRegistry::from_config(&config.policies)?;

        let store: Arc<dyn CounterStore> = match config.store.backend {
            StoreBackend::Memory => {
                info!("Using in-process counter store");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Redis => Arc::new(
                RedisStore::connect(
                    &config.store.redis_url,
                    &config.store.namespace,
                    config.store.atomic,
                )
                .await?,
            ),
        };

        Ok(Self::new(
            store,
            policies,
            config.abuse,
            config.store.timeout(),
        ))
    }

    /// The current policy table.
    pub fn policies(&self) -> Arc<PolicyRegistry> {
        self.policies.read().clone()
    }

    /// Swap in a new policy table. Requests already in flight keep the old one.
    pub fn replace_policies(&self, registry: PolicyRegistry) {
        info!(classes = registry.len(), "Replacing policy table");
        *self.policies.write() = Arc::new(registry);
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn detector(&self) -> &AbuseDetector {
        &self.detector
    }

    /// Admit a request at the current time.
    pub async fn admit(&self, meta: &RequestMeta, endpoint_class: &str) -> Decision {
        self.admit_at(meta, endpoint_class, unix_now()).await
    }

    /// Admit a request at time `now` (Unix seconds).
    ///
    /// Never fails. Store trouble resolves to the policy's failure mode, and a
    /// failed abuse evaluation degrades to a standard denial.
    #[instrument(
        skip(self, meta),
        fields(method = %meta.method, path = %meta.path)
    )]
    pub async fn admit_at(&self, meta: &RequestMeta, endpoint_class: &str, now: f64) -> Decision {
        let subject = Subject::resolve(meta);
        let key = RateLimitKey::new(subject.clone(), endpoint_class);
        let registry = self.policies();
        let policy = registry.get(endpoint_class);

        // Primary window and auxiliary history live under disjoint keys.
        let (verdict, recorded) = tokio::join!(
            self.limiter.check_at(&key, policy, now),
            self.detector.record_at(&subject, endpoint_class, now),
        );

        if let Err(e) = recorded {
            // A degraded verdict means the limiter already reported this store failure.
            if verdict.degraded {
                debug!(subject = %subject, error = %e, "Failed to record request history");
            } else {
                warn!(subject = %subject, error = %e, "Failed to record request history");
            }
        }

        if verdict.allowed {
            trace!(
                subject = %subject,
                remaining = verdict.remaining,
                "Request admitted"
            );
            return Decision::Allow(verdict);
        }

        // Fail-closed denial: the store is down, so there is no history to evaluate.
        if verdict.degraded {
            return Decision::Deny(Denial {
                verdict,
                reason: DenialReason::RateLimited,
                signals: BTreeSet::new(),
            });
        }

        let abuse = match self.detector.evaluate_at(&subject, now).await {
            Ok(abuse) => abuse,
            Err(e) => {
                error!(subject = %subject, error = %e, "Abuse evaluation failed");
                AbuseVerdict::default()
            }
        };

        if abuse.is_suspicious {
            let escalated = escalate(verdict);
            error!(
                subject = %subject,
                endpoint_class = %endpoint_class,
                signals = ?abuse.signals,
                retry_after = escalated.reset_seconds,
                "Rate limit exceeded with suspicious activity"
            );
            return Decision::Deny(Denial {
                verdict: escalated,
                reason: DenialReason::SuspiciousActivity,
                signals: abuse.signals,
            });
        }

        debug!(
            subject = %subject,
            endpoint_class = %endpoint_class,
            retry_after = verdict.reset_seconds,
            "Rate limit exceeded"
        );
        Decision::Deny(Denial {
            verdict,
            reason: DenialReason::RateLimited,
            signals: BTreeSet::new(),
        })
    }
}

/// Double the cooldown for a suspicious subject.
fn escalate(verdict: Verdict) -> Verdict {
    Verdict {
        reset_seconds: verdict.reset_seconds.saturating_mul(2),
        ..verdict
    }
}
