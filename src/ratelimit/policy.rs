//! Rate limit policies and policy resolution.
//!
//! A [`PolicySet`] holds a global default, optional per-scope defaults and
//! endpoint-specific policies. Resolution picks the most specific valid
//! policy for a request: exact endpoint match, then longest prefix match,
//! then the scope default, then the global default, then the built-in
//! default.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::scope::ScopeType;
use crate::error::{GatekeeperError, Result};
use crate::time::ceil_secs;

/// Upper bound on how long an idle token bucket is remembered (30 days).
pub const MAX_BUCKET_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// The limiting algorithm a policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Smooth refill with burst allowance
    #[default]
    TokenBucket,
    /// Weighted blend of the current and previous window
    SlidingWindow,
    /// Hard reset at each window boundary
    FixedWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_window_seconds() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

/// A rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Requests allowed per window (token bucket: bucket size)
    pub capacity: u64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Tokens per second; defaults to `capacity / window_seconds`
    #[serde(default)]
    pub refill_rate: Option<f64>,
    /// Extra tokens above capacity (token bucket only)
    #[serde(default)]
    pub burst: u64,
    /// Seconds a violator stays blocked after a deny; 0 disables blocking
    #[serde(default)]
    pub block_duration: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Scope this policy counts under, overriding the request's default
    #[serde(default)]
    pub scope: Option<ScopeType>,
}

impl Default for Policy {
    /// 100 requests per minute, token bucket, burst 10, 60 s block.
    fn default() -> Self {
        Self::token_bucket(100, 60).with_burst(10).with_block_duration(60)
    }
}

impl Policy {
    fn new(algorithm: Algorithm, capacity: u64, window_seconds: u64) -> Self {
        Self {
            algorithm,
            capacity,
            window_seconds,
            refill_rate: None,
            burst: 0,
            block_duration: 0,
            enabled: true,
            scope: None,
        }
    }

    pub fn token_bucket(capacity: u64, window_seconds: u64) -> Self {
        Self::new(Algorithm::TokenBucket, capacity, window_seconds)
    }

    pub fn sliding_window(capacity: u64, window_seconds: u64) -> Self {
        Self::new(Algorithm::SlidingWindow, capacity, window_seconds)
    }

    pub fn fixed_window(capacity: u64, window_seconds: u64) -> Self {
        Self::new(Algorithm::FixedWindow, capacity, window_seconds)
    }

    pub fn with_refill_rate(mut self, tokens_per_second: f64) -> Self {
        self.refill_rate = Some(tokens_per_second);
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_block_duration(mut self, seconds: u64) -> Self {
        self.block_duration = seconds;
        self
    }

    pub fn with_scope(mut self, scope: ScopeType) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the policy for values no algorithm can work with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(GatekeeperError::Config("capacity must be positive".to_string()));
        }
        if self.window_seconds == 0 {
            return Err(GatekeeperError::Config("window_seconds must be positive".to_string()));
        }
        if let Some(rate) = self.refill_rate {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(GatekeeperError::Config(format!(
                    "refill_rate must be a positive number, got {}",
                    rate
                )));
            }
        }
        Ok(())
    }

    /// Window length in seconds.
    pub fn window(&self) -> f64 {
        self.window_seconds as f64
    }

    /// Effective token refill rate per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.capacity as f64 / self.window_seconds as f64)
    }

    /// Largest number of tokens a bucket can hold.
    pub fn max_tokens(&self) -> f64 {
        (self.capacity + self.burst) as f64
    }

    /// The limit reported to clients.
    pub fn limit(&self) -> u64 {
        match self.algorithm {
            Algorithm::TokenBucket => self.capacity + self.burst,
            Algorithm::SlidingWindow | Algorithm::FixedWindow => self.capacity,
        }
    }

    /// How long counter state for this policy must outlive its last update.
    ///
    /// A bucket is kept until it would have refilled, but never longer than
    /// [`MAX_BUCKET_TTL_SECS`]; an idle bucket past that starts full again.
    pub fn state_ttl(&self) -> Duration {
        let secs = match self.algorithm {
            Algorithm::TokenBucket => ceil_secs(self.max_tokens() / self.refill_rate())
                .saturating_add(1)
                .min(MAX_BUCKET_TTL_SECS),
            Algorithm::SlidingWindow => self.window_seconds.saturating_mul(2),
            Algorithm::FixedWindow => self.window_seconds.saturating_add(1),
        };
        Duration::from_secs(secs)
    }
}

/// A policy bound to an endpoint path (exact or prefix).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    pub path: String,
    #[serde(flatten)]
    pub policy: Policy,
}

/// A default policy for every request counted under one scope type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopePolicy {
    pub applies_to: ScopeType,
    #[serde(flatten)]
    pub policy: Policy,
}

/// Where a resolved policy came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    Endpoint(String),
    Scope(ScopeType),
    Global,
    BuiltIn,
}

impl std::fmt::Display for PolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicySource::Endpoint(path) => write!(f, "endpoint:{}", path),
            PolicySource::Scope(scope) => write!(f, "scope:{}", scope),
            PolicySource::Global => f.write_str("global"),
            PolicySource::BuiltIn => f.write_str("built_in"),
        }
    }
}

/// The policy chosen for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolicy {
    pub policy: Policy,
    pub source: PolicySource,
    /// The scope the request is counted under
    pub scope: ScopeType,
}

/// A complete set of policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub global: Policy,
    #[serde(default)]
    pub scopes: Vec<ScopePolicy>,
    #[serde(default)]
    pub endpoints: Vec<EndpointPolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            global: Policy::default(),
            scopes: Vec::new(),
            endpoints: vec![
                EndpointPolicy::new("/auth/login", Policy::token_bucket(10, 60).with_block_duration(60)),
                EndpointPolicy::new("/auth/register", Policy::token_bucket(5, 60).with_block_duration(60)),
                EndpointPolicy::new("/auth/refresh", Policy::token_bucket(20, 60).with_block_duration(60)),
                EndpointPolicy::new("/users/register", Policy::token_bucket(5, 3600).with_block_duration(60)),
            ],
        }
    }
}

impl EndpointPolicy {
    pub fn new(path: impl Into<String>, policy: Policy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }
}

impl PolicySet {
    /// A set with only a global policy.
    pub fn with_global(global: Policy) -> Self {
        Self {
            global,
            scopes: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    /// Load a policy set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse policy set: {}", e)))
    }

    /// Report every malformed policy in the set.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(e) = self.global.validate() {
            problems.push(format!("global: {}", e));
        }
        for entry in &self.scopes {
            if let Err(e) = entry.policy.validate() {
                problems.push(format!("scope {}: {}", entry.applies_to, e));
            }
        }
        for entry in &self.endpoints {
            if entry.path.is_empty() {
                problems.push("endpoint with empty path".to_string());
            }
            if let Err(e) = entry.policy.validate() {
                problems.push(format!("endpoint {}: {}", entry.path, e));
            }
        }

        problems
    }

    /// The default policy for a scope type, if one is configured.
    pub fn scope_policy(&self, scope: ScopeType) -> Option<&Policy> {
        self.scopes
            .iter()
            .find(|entry| entry.applies_to == scope)
            .map(|entry| &entry.policy)
    }

    /// Endpoint policies matching `path`, most specific first: the exact
    /// match, then prefix matches from longest to shortest.
    fn endpoint_candidates<'a>(&'a self, path: &str) -> Vec<&'a EndpointPolicy> {
        let mut exact = Vec::new();
        let mut prefixed = Vec::new();

        for entry in &self.endpoints {
            if entry.path.is_empty() {
                continue;
            }
            if entry.path == path {
                exact.push(entry);
            } else if path.starts_with(entry.path.as_str()) {
                prefixed.push(entry);
            }
        }

        prefixed.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        exact.extend(prefixed);
        exact
    }

    /// Pick the policy for a request to `path` whose default scope is
    /// `default_scope`.
    ///
    /// Malformed policies are skipped with a warning, falling back to the
    /// next less specific one.
    pub fn resolve(&self, path: &str, default_scope: ScopeType) -> ResolvedPolicy {
        for entry in self.endpoint_candidates(path) {
            match entry.policy.validate() {
                Ok(()) => {
                    return ResolvedPolicy {
                        scope: entry.policy.scope.unwrap_or(default_scope),
                        policy: entry.policy.clone(),
                        source: PolicySource::Endpoint(entry.path.clone()),
                    }
                }
                Err(e) => warn!(endpoint = %entry.path, error = %e, "Skipping malformed endpoint policy"),
            }
        }

        if let Some(policy) = self.scope_policy(default_scope) {
            match policy.validate() {
                Ok(()) => {
                    return ResolvedPolicy {
                        scope: policy.scope.unwrap_or(default_scope),
                        policy: policy.clone(),
                        source: PolicySource::Scope(default_scope),
                    }
                }
                Err(e) => warn!(scope = %default_scope, error = %e, "Skipping malformed scope policy"),
            }
        }

        match self.global.validate() {
            Ok(()) => ResolvedPolicy {
                scope: self.global.scope.unwrap_or(default_scope),
                policy: self.global.clone(),
                source: PolicySource::Global,
            },
            Err(e) => {
                warn!(error = %e, "Global policy is malformed, using built-in default");
                ResolvedPolicy {
                    scope: default_scope,
                    policy: Policy::default(),
                    source: PolicySource::BuiltIn,
                }
            }
        }
    }
}

/// Holder for the live policy set.
///
/// Readers take a snapshot (`Arc`) and keep using it for the whole request,
/// so a concurrent replacement is never observed half-applied.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySet>>,
}

impl PolicyStore {
    pub fn new(set: PolicySet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// The current policy set.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        self.current.read().clone()
    }

    /// Replace the whole policy set.
    pub fn replace(&self, set: PolicySet) {
        let problems = set.validate();
        if !problems.is_empty() {
            warn!(problems = ?problems, "Installing policy set with malformed policies; they will fall back");
        }

        info!(
            endpoints = set.endpoints.len(),
            scopes = set.scopes.len(),
            "Replacing rate limit policy set"
        );
        *self.current.write() = Arc::new(set);
    }

    /// Apply a change to a copy of the current set and install the result.
    pub fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut PolicySet),
    {
        let mut guard = self.current.write();
        let mut next = PolicySet::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(PolicySet::default())
    }
}
