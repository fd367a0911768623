//! Rate-limit subject resolution and window keys.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Request metadata supplied by the routing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Authenticated user id, if the request carried valid credentials
    #[serde(default)]
    pub user_id: Option<String>,
    /// Session token from the session cookie
    #[serde(default)]
    pub session_token: Option<String>,
    /// Source network address
    pub remote_addr: IpAddr,
    /// Target path
    #[serde(default)]
    pub path: String,
    /// HTTP method
    #[serde(default)]
    pub method: String,
}

impl RequestMeta {
    /// Metadata for an anonymous request from `remote_addr`.
    pub fn from_addr(remote_addr: IpAddr) -> Self {
        Self {
            user_id: None,
            session_token: None,
            remote_addr,
            path: String::new(),
            method: String::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_route(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = method.into();
        self.path = path.into();
        self
    }
}

/// The identity a request is counted against.
///
/// Exactly one of the three is chosen, in order of precision: the
/// authenticated user survives address changes, the session covers returning
/// anonymous visitors, and the address is always available.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    User(String),
    Session(String),
    Ip(IpAddr),
}

impl Subject {
    /// Resolve the subject for a request. Blank ids count as absent.
    pub fn resolve(meta: &RequestMeta) -> Self {
        if let Some(user) = non_blank(&meta.user_id) {
            return Subject::User(user.to_string());
        }
        if let Some(token) = non_blank(&meta.session_token) {
            return Subject::Session(token.to_string());
        }
        Subject::Ip(meta.remote_addr)
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::User(id) => write!(f, "user:{}", id),
            Subject::Session(token) => write!(f, "session:{}", token),
            Subject::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

/// A key that uniquely identifies one sliding window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Who is being counted
    pub subject: Subject,
    /// Which policy group the request belongs to
    pub endpoint_class: String,
}

impl RateLimitKey {
    pub fn new(subject: Subject, endpoint_class: &str) -> Self {
        Self {
            subject,
            endpoint_class: endpoint_class.to_string(),
        }
    }

    /// Key of the window's sorted set in the counter store.
    pub fn store_key(&self) -> String {
        format!("rate_limit:{}:{}", self.endpoint_class, self.subject)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.store_key())
    }
}
