//! Rate limiting: subjects, policies and the sliding-window limiter.

mod limiter;
mod policy;
mod subject;

pub use limiter::{SlidingWindowLimiter, Verdict, DEFAULT_STORE_TIMEOUT};
pub use policy::{
    FailureMode, Policy, PolicyRegistry, PolicySpec, PolicyUnit, BUILTIN_POLICIES,
    DEFAULT_POLICY, DEFAULT_POLICY_NAME,
};
pub use subject::{RateLimitKey, RequestMeta, Subject};

#[cfg(test)]
pub(crate) use limiter::tests::StalledStore;
