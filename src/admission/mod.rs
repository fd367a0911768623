//! Admission decisions: the single entry point invoked once per request.
//!
//! ```text
//! START -> RESOLVE_SUBJECT -> CHECK_WINDOW -> ALLOW
//!                                          -> CHECK_ABUSE -> DENY_STANDARD
//!                                                         -> DENY_ESCALATED
//! ```

mod decision;
mod engine;

pub use decision::{Decision, DecisionState, Denial, DenialBody, DenialReason};
pub use engine::AdmissionEngine;
