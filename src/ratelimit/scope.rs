//! Scope key generation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatekeeperError, Result};

/// Placeholder used when a scope needs a user id the request doesn't carry.
pub const ANONYMOUS: &str = "anonymous";

/// The dimensions a rate limit counter is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    /// One counter for all traffic
    Global,
    Ip,
    User,
    Endpoint,
    IpUser,
    IpEndpoint,
    UserEndpoint,
    IpUserEndpoint,
}

impl ScopeType {
    pub const ALL: [ScopeType; 8] = [
        ScopeType::Global,
        ScopeType::Ip,
        ScopeType::User,
        ScopeType::Endpoint,
        ScopeType::IpUser,
        ScopeType::IpEndpoint,
        ScopeType::UserEndpoint,
        ScopeType::IpUserEndpoint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Ip => "ip",
            ScopeType::User => "user",
            ScopeType::Endpoint => "endpoint",
            ScopeType::IpUser => "ip_user",
            ScopeType::IpEndpoint => "ip_endpoint",
            ScopeType::UserEndpoint => "user_endpoint",
            ScopeType::IpUserEndpoint => "ip_user_endpoint",
        }
    }

    pub fn uses_ip(&self) -> bool {
        matches!(
            self,
            ScopeType::Ip | ScopeType::IpUser | ScopeType::IpEndpoint | ScopeType::IpUserEndpoint
        )
    }

    pub fn uses_user(&self) -> bool {
        matches!(
            self,
            ScopeType::User
                | ScopeType::IpUser
                | ScopeType::UserEndpoint
                | ScopeType::IpUserEndpoint
        )
    }

    pub fn uses_endpoint(&self) -> bool {
        matches!(
            self,
            ScopeType::Endpoint
                | ScopeType::IpEndpoint
                | ScopeType::UserEndpoint
                | ScopeType::IpUserEndpoint
        )
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeType {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        ScopeType::ALL
            .iter()
            .copied()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| GatekeeperError::Config(format!("unknown scope type: {}", s)))
    }
}

/// A counter key that uniquely identifies one caller (or group of callers)
/// under a scope type.
///
/// Components always appear in the order ip, user, endpoint and are joined
/// with `|`, e.g. `ip_user_endpoint:203.0.113.4|42|/auth/login`. The global
/// scope renders as plain `global`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    /// Build the key, failing if the scope needs an identifier that is
    /// missing or empty.
    pub fn try_build(
        scope: ScopeType,
        ip: &str,
        user_id: Option<&str>,
        endpoint: &str,
    ) -> Result<Self> {
        let user_id = user_id.filter(|id| !id.is_empty());

        if scope.uses_ip() && ip.is_empty() {
            return Err(GatekeeperError::Config(format!(
                "scope {} requires a caller ip",
                scope
            )));
        }
        if scope.uses_user() && user_id.is_none() {
            return Err(GatekeeperError::Config(format!(
                "scope {} requires a user id",
                scope
            )));
        }

        Ok(Self::compose(scope, ip, user_id.unwrap_or(ANONYMOUS), endpoint))
    }

    /// Build the key, substituting `anonymous` for any missing identifier.
    ///
    /// Never fails: a request must not be rejected because the configured
    /// scope doesn't fit it.
    pub fn resolve(scope: ScopeType, ip: &str, user_id: Option<&str>, endpoint: &str) -> Self {
        match Self::try_build(scope, ip, user_id, endpoint) {
            Ok(key) => key,
            Err(e) => {
                warn!(scope = %scope, error = %e, "Substituting anonymous identifier in scope key");
                let ip = if ip.is_empty() { ANONYMOUS } else { ip };
                let user_id = user_id.filter(|id| !id.is_empty()).unwrap_or(ANONYMOUS);
                Self::compose(scope, ip, user_id, endpoint)
            }
        }
    }

    fn compose(scope: ScopeType, ip: &str, user_id: &str, endpoint: &str) -> Self {
        if scope == ScopeType::Global {
            return Self(scope.as_str().to_string());
        }

        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if scope.uses_ip() {
            parts.push(ip);
        }
        if scope.uses_user() {
            parts.push(user_id);
        }
        if scope.uses_endpoint() {
            parts.push(endpoint);
        }

        Self(format!("{}:{}", scope, parts.join("|")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the violator block kept for this scope key.
    pub fn block_key(&self) -> String {
        format!("block:{}", self.0)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
