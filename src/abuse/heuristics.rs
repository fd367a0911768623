//! Suspicion signals and the pure classifier that produces them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One heuristic indicator of automated traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionSignal {
    /// Too many requests in the frequency window
    HighFrequency,
    /// Near-constant spacing between recent requests
    RegularPattern,
    /// Too many distinct endpoint classes in the scan window
    EndpointScanning,
}

impl SuspicionSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspicionSignal::HighFrequency => "high_frequency",
            SuspicionSignal::RegularPattern => "regular_pattern",
            SuspicionSignal::EndpointScanning => "endpoint_scanning",
        }
    }
}

impl std::fmt::Display for SuspicionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an abuse evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AbuseVerdict {
    pub is_suspicious: bool,
    pub signals: BTreeSet<SuspicionSignal>,
}

/// Thresholds for the three heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseThresholds {
    /// Length of the frequency window in seconds
    pub frequency_window_secs: u64,
    /// Requests in the frequency window above which the signal fires
    pub max_requests_per_window: u64,
    /// How many of the latest timestamps the pattern check looks at
    pub pattern_samples: usize,
    /// Fewer timestamps than this and the pattern check stays quiet
    pub min_pattern_samples: usize,
    /// Interval variance (seconds squared) below which spacing counts as regular
    pub min_interval_variance: f64,
    /// Length of the endpoint scanning window in seconds
    pub scan_window_secs: u64,
    /// Distinct endpoint classes above which the signal fires
    pub max_distinct_endpoints: u64,
    /// Signals that must fire together to flag a subject
    pub signals_required: usize,
}

impl Default for AbuseThresholds {
    fn default() -> Self {
        Self {
            frequency_window_secs: 60,
            max_requests_per_window: 50,
            pattern_samples: 10,
            min_pattern_samples: 5,
            min_interval_variance: 1.0,
            scan_window_secs: 3600,
            max_distinct_endpoints: 10,
            signals_required: 2,
        }
    }
}

/// Counts gathered for one subject at evaluation time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbuseSnapshot {
    /// Requests inside the frequency window
    pub recent_requests: u64,
    /// Latest request timestamps, ascending
    pub recent_timestamps: Vec<f64>,
    /// Distinct endpoint classes inside the scan window
    pub distinct_endpoints: u64,
}

/// Population variance of the gaps between consecutive timestamps.
///
/// `None` with fewer than two timestamps.
pub fn interval_variance(timestamps: &[f64]) -> Option<f64> {
    if timestamps.len() < 2 {
        return None;
    }

    let intervals: Vec<f64> = timestamps.windows(2).map(|w| w[1] - w[0]).collect();
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    Some(intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n)
}

/// Evaluate the heuristics over a snapshot.
pub fn classify(snapshot: &AbuseSnapshot, thresholds: &AbuseThresholds) -> AbuseVerdict {
    let mut signals = BTreeSet::new();

    if snapshot.recent_requests > thresholds.max_requests_per_window {
        signals.insert(SuspicionSignal::HighFrequency);
    }

    if is_regular(&snapshot.recent_timestamps, thresholds) {
        signals.insert(SuspicionSignal::RegularPattern);
    }

    if snapshot.distinct_endpoints > thresholds.max_distinct_endpoints {
        signals.insert(SuspicionSignal::EndpointScanning);
    }

    AbuseVerdict {
        is_suspicious: signals.len() >= thresholds.signals_required,
        signals,
    }
}

fn is_regular(timestamps: &[f64], thresholds: &AbuseThresholds) -> bool {
    let skip = timestamps.len().saturating_sub(thresholds.pattern_samples);
    let samples = &timestamps[skip..];

    if samples.len() < thresholds.min_pattern_samples.max(2) {
        return false;
    }

    interval_variance(samples).is_some_and(|variance| variance < thresholds.min_interval_variance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evenly_spaced(count: usize, gap: f64) -> Vec<f64> {
        (0..count).map(|i| 1000.0 + i as f64 * gap).collect()
    }

    #[test]
    fn test_interval_variance() {
        assert_eq!(interval_variance(&[]), None);
        assert_eq!(interval_variance(&[1.0]), None);
        assert_eq!(interval_variance(&evenly_spaced(6, 2.0)), Some(0.0));

        // Gaps of 1 and 3: mean 2, variance 1.
        assert_eq!(interval_variance(&[0.0, 1.0, 4.0]), Some(1.0));
    }

    #[test]
    fn test_no_signals_on_quiet_subject() {
        let verdict = classify(&AbuseSnapshot::default(), &AbuseThresholds::default());
        assert!(!verdict.is_suspicious);
        assert!(verdict.signals.is_empty());
    }

    #[test]
    fn test_high_frequency_is_strictly_above_threshold() {
        let thresholds = AbuseThresholds::default();
        let at_limit = AbuseSnapshot {
            recent_requests: 50,
            ..Default::default()
        };
        assert!(classify(&at_limit, &thresholds).signals.is_empty());

        let over = AbuseSnapshot {
            recent_requests: 51,
            ..Default::default()
        };
        let verdict = classify(&over, &thresholds);
        assert!(verdict.signals.contains(&SuspicionSignal::HighFrequency));
        assert!(!verdict.is_suspicious);
    }

    #[test]
    fn test_regular_pattern_needs_minimum_samples() {
        let thresholds = AbuseThresholds::default();

        let four = AbuseSnapshot {
            recent_timestamps: evenly_spaced(4, 1.0),
            ..Default::default()
        };
        assert!(classify(&four, &thresholds).signals.is_empty());

        let five = AbuseSnapshot {
            recent_timestamps: evenly_spaced(5, 1.0),
            ..Default::default()
        };
        assert_eq!(
            classify(&five, &thresholds).signals,
            BTreeSet::from([SuspicionSignal::RegularPattern])
        );
    }

    #[test]
    fn test_irregular_spacing_is_not_a_pattern() {
        let snapshot = AbuseSnapshot {
            recent_timestamps: vec![0.0, 3.0, 4.0, 11.0, 13.0, 30.0],
            ..Default::default()
        };
        assert!(classify(&snapshot, &AbuseThresholds::default())
            .signals
            .is_empty());
    }

    #[test]
    fn test_pattern_only_considers_latest_samples() {
        // Erratic history followed by ten evenly spaced requests.
        let mut timestamps = vec![0.0, 7.0, 9.0, 40.0];
        timestamps.extend(evenly_spaced(10, 2.0));
        let snapshot = AbuseSnapshot {
            recent_timestamps: timestamps,
            ..Default::default()
        };
        assert!(classify(&snapshot, &AbuseThresholds::default())
            .signals
            .contains(&SuspicionSignal::RegularPattern));
    }

    #[test]
    fn test_two_signals_make_a_subject_suspicious() {
        let snapshot = AbuseSnapshot {
            recent_requests: 60,
            recent_timestamps: Vec::new(),
            distinct_endpoints: 11,
        };
        let verdict = classify(&snapshot, &AbuseThresholds::default());
        assert!(verdict.is_suspicious);
        assert_eq!(
            verdict.signals,
            BTreeSet::from([
                SuspicionSignal::HighFrequency,
                SuspicionSignal::EndpointScanning
            ])
        );
    }

    #[test]
    fn test_thresholds_are_swappable() {
        let strict = AbuseThresholds {
            max_requests_per_window: 5,
            signals_required: 1,
            ..Default::default()
        };
        let snapshot = AbuseSnapshot {
            recent_requests: 6,
            ..Default::default()
        };
        assert!(classify(&snapshot, &strict).is_suspicious);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(SuspicionSignal::HighFrequency.to_string(), "high_frequency");
        assert_eq!(
            serde_json::to_string(&SuspicionSignal::EndpointScanning).unwrap(),
            "\"endpoint_scanning\""
        );
    }
}
