//! Turnstile - Adaptive Rate Limiting & Abuse Detection
//!
//! This crate makes the allow/deny decision for every inbound request of a
//! web platform. Requests are counted per subject and endpoint class in
//! sliding windows kept in a shared counter store, denials are checked
//! against heuristics for scripted traffic, and store failures fail open.

pub mod abuse;
pub mod admission;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
