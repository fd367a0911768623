//! Heuristic abuse detection.
//!
//! Consulted only once a request has been denied, to decide whether the
//! denial should be escalated.

mod detector;
mod heuristics;

pub use detector::AbuseDetector;
pub use heuristics::{
    classify, interval_variance, AbuseSnapshot, AbuseThresholds, AbuseVerdict, SuspicionSignal,
};
