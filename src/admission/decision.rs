//! Admission decisions handed back to the routing layer.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::abuse::SuspicionSignal;
use crate::ratelimit::Verdict;

/// Terminal state of one admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Allow,
    DenyStandard,
    DenyEscalated,
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The window is full
    RateLimited,
    /// The window is full and the subject looks automated
    SuspiciousActivity,
}

/// A denied admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// Quota state; `reset_seconds` is already escalated when suspicious
    pub verdict: Verdict,
    pub reason: DenialReason,
    /// Signals that fired, empty for a standard denial
    pub signals: BTreeSet<SuspicionSignal>,
}

impl Denial {
    /// Seconds the client should wait before retrying.
    pub fn retry_after(&self) -> u64 {
        self.verdict.reset_seconds
    }

    pub fn is_escalated(&self) -> bool {
        self.reason == DenialReason::SuspiciousActivity
    }

    /// Body of the rate-limit-exceeded response.
    pub fn body(&self) -> DenialBody {
        DenialBody {
            error: "rate_limit_exceeded",
            reason: self.reason,
            limit: self.verdict.limit,
            remaining: self.verdict.remaining,
            retry_after: self.retry_after(),
            suspicious_activity: self.is_escalated(),
            signals: self.signals.clone(),
        }
    }
}

/// Serializable rejection body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DenialBody {
    pub error: &'static str,
    pub reason: DenialReason,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub suspicious_activity: bool,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub signals: BTreeSet<SuspicionSignal>,
}

/// Result of admitting one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow(Verdict),
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// The quota state behind the decision.
    pub fn verdict(&self) -> &Verdict {
        match self {
            Decision::Allow(verdict) => verdict,
            Decision::Deny(denial) => &denial.verdict,
        }
    }

    pub fn state(&self) -> DecisionState {
        match self {
            Decision::Allow(_) => DecisionState::Allow,
            Decision::Deny(denial) if denial.is_escalated() => DecisionState::DenyEscalated,
            Decision::Deny(_) => DecisionState::DenyStandard,
        }
    }

    /// Rate limit headers for the response, allowed or not.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        self.verdict().headers()
    }
}
