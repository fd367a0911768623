//! Per-endpoint-class rate limit policies.
//!
//! Policies are written as `"<count>/<period>"` strings (for example
//! `"10/minute"`) and resolved once, when the registry is built, into a
//! limit and a window length. The request path only ever reads them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::PoliciesConfig;
use crate::error::{Result, TurnstileError};

/// Name of the policy applied to unregistered endpoint classes.
pub const DEFAULT_POLICY_NAME: &str = "default";

/// Default policy when the configuration does not name one.
pub const DEFAULT_POLICY: &str = "100/hour";

/// Endpoint classes known to the platform and their policies.
pub const BUILTIN_POLICIES: &[(&str, &str)] = &[
    ("picks_generation", "5/hour"),
    ("picks_list", "100/hour"),
    ("user_auth", "10/minute"),
    ("user_data", "50/hour"),
    ("payment_create", "3/hour"),
    ("payment_status", "20/hour"),
    ("public_general", "200/hour"),
    ("public_health", "1000/hour"),
    ("global", "500/hour"),
];

/// Time unit of a policy window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyUnit {
    Minute,
    Hour,
    Day,
}

impl PolicyUnit {
    /// Length of the unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            PolicyUnit::Minute => 60,
            PolicyUnit::Hour => 3600,
            PolicyUnit::Day => 86400,
        }
    }

    /// Map a period name to a unit. Unknown names fall back to `Hour`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "minute" => PolicyUnit::Minute,
            "hour" => PolicyUnit::Hour,
            "day" => PolicyUnit::Day,
            other => {
                warn!(period = %other, "Unknown policy period, using hour");
                PolicyUnit::Hour
            }
        }
    }
}

/// A parsed `"<count>/<period>"` policy string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySpec {
    pub count: u64,
    pub unit: PolicyUnit,
}

impl PolicySpec {
    pub fn new(count: u64, unit: PolicyUnit) -> Self {
        Self { count, unit }
    }
}

impl FromStr for PolicySpec {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        let (count, period) = s
            .split_once('/')
            .ok_or_else(|| TurnstileError::InvalidPolicy(s.to_string()))?;

        let count: u64 = count
            .trim()
            .parse()
            .map_err(|_| TurnstileError::InvalidPolicy(s.to_string()))?;
        if count == 0 {
            return Err(TurnstileError::InvalidPolicy(s.to_string()));
        }

        Ok(Self {
            count,
            unit: PolicyUnit::from_name(period.trim()),
        })
    }
}

/// What the limiter does when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Allow the request.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// A resolved rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub endpoint_class: String,
    pub limit: u64,
    pub window_seconds: u64,
    pub failure_mode: FailureMode,
}

impl Policy {
    pub fn new(endpoint_class: &str, spec: PolicySpec) -> Self {
        Self {
            endpoint_class: endpoint_class.to_string(),
            limit: spec.count,
            window_seconds: spec.unit.seconds(),
            failure_mode: FailureMode::Open,
        }
    }
}

/// Maps endpoint classes to policies.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    default: Policy,
    policies: HashMap<String, Policy>,
}

impl PolicyRegistry {
    /// Create a registry with only a default policy.
    pub fn new(default: PolicySpec) -> Self {
        Self {
            default: Policy::new(DEFAULT_POLICY_NAME, default),
            policies: HashMap::new(),
        }
    }

    /// Create a registry holding the platform's built-in endpoint classes.
    pub fn with_builtin_classes() -> Result<Self> {
        let mut registry = Self::new(DEFAULT_POLICY.parse()?);
        for (class, policy) in BUILTIN_POLICIES {
            registry.register_str(class, policy)?;
        }
        Ok(registry)
    }

    /// Build a registry from configuration. Configured classes override
    /// built-in ones.
    pub fn from_config(config: &PoliciesConfig) -> Result<Self> {
        let mut registry = if config.builtin {
            Self::with_builtin_classes()?
        } else {
            Self::new(DEFAULT_POLICY.parse()?)
        };

        registry.set_default(config.default.parse()?);

        for (class, policy) in &config.classes {
            registry.register_str(class, policy)?;
        }

        for class in &config.fail_closed {
            registry.set_failure_mode(class, FailureMode::Closed);
        }

        info!(
            classes = registry.len(),
            default_limit = registry.default.limit,
            default_window = registry.default.window_seconds,
            "Policy registry loaded"
        );

        Ok(registry)
    }

    /// Replace the default policy.
    pub fn set_default(&mut self, spec: PolicySpec) {
        let failure_mode = self.default.failure_mode;
        self.default = Policy::new(DEFAULT_POLICY_NAME, spec);
        self.default.failure_mode = failure_mode;
    }

    /// Register a policy for an endpoint class. The last registration wins,
    /// but a previously configured failure mode is kept.
    pub fn register(&mut self, endpoint_class: &str, spec: PolicySpec) {
        let mut policy = Policy::new(endpoint_class, spec);
        if let Some(existing) = self.policies.get(endpoint_class) {
            policy.failure_mode = existing.failure_mode;
        }
        self.policies.insert(endpoint_class.to_string(), policy);
    }

    /// Parse and register a `"<count>/<period>"` policy string.
    pub fn register_str(&mut self, endpoint_class: &str, policy: &str) -> Result<()> {
        self.register(endpoint_class, policy.parse()?);
        Ok(())
    }

    /// Set the failure mode of an endpoint class. An unregistered class gets a
    /// copy of the default policy.
    pub fn set_failure_mode(&mut self, endpoint_class: &str, mode: FailureMode) {
        let default = &self.default;
        self.policies
            .entry(endpoint_class.to_string())
            .or_insert_with(|| Policy {
                endpoint_class: endpoint_class.to_string(),
                ..default.clone()
            })
            .failure_mode = mode;
    }

    /// Look up the policy for an endpoint class, falling back to the default.
    pub fn get(&self, endpoint_class: &str) -> &Policy {
        self.policies.get(endpoint_class).unwrap_or(&self.default)
    }

    /// The default policy.
    pub fn default_policy(&self) -> &Policy {
        &self.default
    }

    /// Whether an endpoint class has its own policy.
    pub fn contains(&self, endpoint_class: &str) -> bool {
        self.policies.contains_key(endpoint_class)
    }

    /// Number of registered endpoint classes.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// All registered policies, sorted by endpoint class.
    pub fn policies(&self) -> Vec<&Policy> {
        let mut policies: Vec<&Policy> = self.policies.values().collect();
        policies.sort_by(|a, b| a.endpoint_class.cmp(&b.endpoint_class));
        policies
    }
}
