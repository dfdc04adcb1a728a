//! Configuration management for Gatekeeper.
//!
//! One [`GatekeeperConfig`] value is built at startup and handed to the
//! admission pipeline; nothing reads configuration from ambient state
//! afterwards. Configuration can come from a YAML file (with environment
//! overrides such as `GATEKEEPER__STORE__TIMEOUT_MS=100`) or from a YAML
//! string.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{PolicySet, ScopeType};

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Whitelist / blacklist configuration
    #[serde(default)]
    pub lists: ListsConfig,

    /// Bot detection weights and thresholds
    #[serde(default)]
    pub bot_detection: BotDetectionConfig,

    /// Response rendering
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Which counter store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store (single instance)
    #[default]
    Memory,
    /// Redis (shared by every instance)
    Redis,
    /// SQLite table
    Sql,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the redis and sql backends
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connection pool size (sql backend)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Upper bound for a single store call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long a rate check waits behind same-key checks from this
    /// process before it is deferred, in milliseconds
    #[serde(default = "default_contention_wait_ms")]
    pub contention_wait_ms: u64,

    /// Seconds between sweeps of expired entries (memory backend)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            max_connections: default_max_connections(),
            timeout_ms: default_timeout_ms(),
            contention_wait_ms: default_contention_wait_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_key_prefix() -> String {
    "gatekeeper:".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_contention_wait_ms() -> u64 {
    250
}

fn default_sweep_interval_secs() -> u64 {
    crate::store::DEFAULT_SWEEP_INTERVAL.as_secs()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scope for requests carrying a user id
    #[serde(default = "default_authenticated_scope")]
    pub authenticated_scope: ScopeType,

    /// Scope for anonymous requests
    #[serde(default = "default_anonymous_scope")]
    pub anonymous_scope: ScopeType,

    /// Path prefixes that are never rate limited
    #[serde(default = "default_rate_limit_exclude_paths")]
    pub exclude_paths: Vec<String>,

    /// Log every denied request at info level
    #[serde(default = "default_true")]
    pub log_violations: bool,

    #[serde(default)]
    pub policies: PolicySet,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            authenticated_scope: default_authenticated_scope(),
            anonymous_scope: default_anonymous_scope(),
            exclude_paths: default_rate_limit_exclude_paths(),
            log_violations: true,
            policies: PolicySet::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_authenticated_scope() -> ScopeType {
    ScopeType::IpUser
}

fn default_anonymous_scope() -> ScopeType {
    ScopeType::Ip
}

fn default_rate_limit_exclude_paths() -> Vec<String> {
    [
        "/health",
        "/metrics",
        "/docs",
        "/openapi.json",
        "/favicon.ico",
        "/api/docs",
        "/api/redoc",
        "/api/v1/openapi.json",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Whitelist / blacklist configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListsConfig {
    #[serde(default = "default_true")]
    pub enable_whitelist: bool,

    #[serde(default = "default_true")]
    pub enable_blacklist: bool,

    /// Path prefixes that skip the list check
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            enable_whitelist: true,
            enable_blacklist: true,
            exclude_paths: Vec::new(),
        }
    }
}

/// Bot detection weights and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotDetectionConfig {
    pub enabled: bool,
    /// Path prefixes that skip bot scoring
    pub exclude_paths: Vec<String>,

    /// Case-insensitive substrings that mark an automation client
    pub user_agent_signatures: Vec<String>,
    pub ua_match_weight: u32,
    /// User agents shorter than this count as missing
    pub min_user_agent_length: usize,
    pub missing_user_agent_weight: u32,

    pub enable_honeypot: bool,
    /// Decoy paths no legitimate client requests
    pub honeypot_paths: Vec<String>,
    pub honeypot_weight: u32,

    /// Timestamps kept per identifier
    pub history_size: usize,
    pub history_ttl_secs: u64,
    /// Intervals with a standard deviation below this look scripted
    pub regularity_threshold_ms: f64,
    /// Intervals needed before regularity is judged
    pub min_intervals: usize,
    pub regularity_weight: u32,
    /// Intervals shorter than this count as fast
    pub min_interval_ms: f64,
    pub fast_request_weight: u32,
    pub max_fast_requests: u32,
    pub max_requests_per_minute: usize,
    pub minute_burst_weight: u32,
    pub max_requests_per_second: usize,
    pub second_burst_weight: u32,

    pub suspicious_threshold: u32,
    pub detection_threshold: u32,

    /// Challenge suspicious callers instead of letting them through
    pub enable_challenge: bool,
    /// Suspicious requests within the strike window before a challenge
    pub challenge_after_strikes: u64,
    /// Suspicious requests within the strike window before a deny; 0 disables
    pub deny_after_strikes: u64,
    pub strike_window_secs: u64,
    /// How long a detected bot stays marked for challenges
    pub challenge_window_secs: u64,
}

impl Default for BotDetectionConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            enabled: true,
            exclude_paths: strings(&["/docs", "/redoc", "/openapi.json", "/favicon.ico", "/static"]),
            user_agent_signatures: strings(&[
                "bot",
                "crawler",
                "spider",
                "scraper",
                "curl",
                "wget",
                "python-requests",
                "httpclient",
                "java/",
                "libwww",
                "phantomjs",
                "selenium",
                "headless",
                "webdriver",
                "bingbot",
                "googlebot",
                "slurp",
                "duckduckbot",
                "baiduspider",
                "yandexbot",
                "facebookexternalhit",
            ]),
            ua_match_weight: 2,
            min_user_agent_length: 10,
            missing_user_agent_weight: 3,
            enable_honeypot: true,
            honeypot_paths: strings(&[
                "/admin.php",
                "/wp-admin",
                "/config.php",
                "/.env",
                "/phpmyadmin",
                "/mysql",
                "/backup",
                "/old",
                "/test",
                "/dev",
                "/staging",
                "/api/private",
                "/_debug",
                "/__debug__",
                "/.git",
                "/.svn",
            ]),
            honeypot_weight: 20,
            history_size: 100,
            history_ttl_secs: 60,
            regularity_threshold_ms: 50.0,
            min_intervals: 3,
            regularity_weight: 3,
            min_interval_ms: 100.0,
            fast_request_weight: 1,
            max_fast_requests: 5,
            max_requests_per_minute: 60,
            minute_burst_weight: 5,
            max_requests_per_second: 5,
            second_burst_weight: 3,
            suspicious_threshold: 10,
            detection_threshold: 15,
            enable_challenge: true,
            challenge_after_strikes: 3,
            deny_after_strikes: 10,
            strike_window_secs: 300,
            challenge_window_secs: 300,
        }
    }
}

/// Response rendering configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Emit `X-Bot-Score` and `X-Bot-Suspicious` on every response
    #[serde(default)]
    pub debug_headers: bool,
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file plus `GATEKEEPER__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("GATEKEEPER")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the pipeline can't work with.
    ///
    /// Malformed policies are reported here even though the pipeline would
    /// fall back around them at request time.
    pub fn validate(&self) -> Result<()> {
        let mut problems = self.rate_limiting.policies.validate();

        if self.store.timeout_ms == 0 {
            problems.push("store.timeout_ms must be positive".to_string());
        }
        if self.store.contention_wait_ms == 0 {
            problems.push("store.contention_wait_ms must be positive".to_string());
        }
        match self.store.backend {
            StoreBackend::Redis | StoreBackend::Sql if self.store.url.is_none() => {
                problems.push("store.url is required for the redis and sql backends".to_string());
            }
            _ => {}
        }

        let bot = &self.bot_detection;
        if bot.history_size == 0 {
            problems.push("bot_detection.history_size must be positive".to_string());
        }
        if bot.suspicious_threshold > bot.detection_threshold {
            problems.push(
                "bot_detection.suspicious_threshold must not exceed detection_threshold".to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatekeeperError::Config(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout_ms, 50);
        assert_eq!(config.store.contention_wait_ms, 250);
        assert_eq!(config.rate_limiting.authenticated_scope, ScopeType::IpUser);
        assert_eq!(config.rate_limiting.anonymous_scope, ScopeType::Ip);

        let global = &config.rate_limiting.policies.global;
        assert_eq!(global.algorithm, Algorithm::TokenBucket);
        assert_eq!(global.capacity, 100);
        assert_eq!(global.burst, 10);
        assert_eq!(global.block_duration, 60);

        assert_eq!(config.bot_detection.detection_threshold, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
store:
  timeout_ms: 20
rate_limiting:
  anonymous_scope: ip_endpoint
  policies:
    global:
      algorithm: fixed_window
      capacity: 5
      window_seconds: 1
bot_detection:
  detection_threshold: 30
admission:
  debug_headers: true
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.timeout_ms, 20);
        assert_eq!(config.rate_limiting.anonymous_scope, ScopeType::IpEndpoint);
        assert_eq!(config.rate_limiting.policies.global.capacity, 5);
        assert!(config.rate_limiting.policies.endpoints.is_empty());
        assert_eq!(config.bot_detection.detection_threshold, 30);
        assert_eq!(config.bot_detection.suspicious_threshold, 10);
        assert!(config.admission.debug_headers);
        assert!(config.lists.enable_blacklist);
    }

    #[test]
    fn test_validate_reports_problems() {
        let yaml = r#"
store:
  backend: redis
rate_limiting:
  policies:
    global:
      capacity: 0
"#;
        let err = GatekeeperConfig::from_yaml(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("store.url"));
        assert!(message.contains("capacity"));
    }
}
