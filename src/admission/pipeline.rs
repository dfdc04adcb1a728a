//! The admission pipeline: list check, rate check, bot check, decision.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, trace, warn};

use crate::bot::{BotAction, BotScorer, BotSignal};
use crate::config::GatekeeperConfig;
use crate::ratelimit::{PolicyStore, RateLimiter, ResolvedPolicy, ScopeKey};
use crate::store::{CounterStore, StoreError, StoreResult};
use crate::time::Timestamp;

use super::decision::{Admission, ChallengeKind, Decision, DenyReason, Stage};
use super::lists::{ListGuard, ListStatus};
use super::metrics::AdmissionMetrics;

/// Caller IP used when no forwarding header or peer address is available.
pub const UNKNOWN_IP: &str = "unknown";

/// Retry hint, in seconds, for a request deferred because its rate limit
/// key could not be updated in time.
pub const CONTENTION_RETRY_AFTER: u64 = 1;

/// One inbound request, as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub ip: String,
    /// Caller identity resolved by upstream authentication
    #[serde(default)]
    pub user_id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Client fingerprint separating callers that share an IP in the bot
    /// timing history; see [`request_fingerprint`]
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default = "Timestamp::now")]
    pub now: Timestamp,
}

impl AdmissionRequest {
    pub fn new(ip: impl Into<String>, path: impl Into<String>, now: Timestamp) -> Self {
        Self {
            ip: ip.into(),
            user_id: None,
            path: path.into(),
            user_agent: None,
            fingerprint: None,
            now,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Identity the bot timing history is kept under.
    fn timing_identity(&self) -> String {
        match self.fingerprint.as_deref().filter(|f| !f.is_empty()) {
            Some(fingerprint) => format!("{}:{}", self.ip, fingerprint),
            None => self.ip.clone(),
        }
    }

    /// Build a request from HTTP request headers.
    ///
    /// The caller IP is the first `X-Forwarded-For` entry, else
    /// `X-Real-IP`, else the peer address. The fingerprint is derived from
    /// the client headers.
    pub fn from_headers(
        headers: &HeaderMap,
        peer: Option<&str>,
        path: impl Into<String>,
        user_id: Option<String>,
        now: Timestamp,
    ) -> Self {
        let user_agent = headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            ip: client_ip(headers, peer),
            user_id,
            path: path.into(),
            user_agent,
            fingerprint: Some(request_fingerprint(headers)),
            now,
        }
    }
}

/// Short stable hash of the headers that tell clients behind one IP apart:
/// `User-Agent`, `Accept`, `Accept-Language` and `Accept-Encoding`.
pub fn request_fingerprint(headers: &HeaderMap) -> String {
    let mut hasher = Sha256::new();
    for (i, name) in [
        http::header::USER_AGENT,
        http::header::ACCEPT,
        http::header::ACCEPT_LANGUAGE,
        http::header::ACCEPT_ENCODING,
    ]
    .iter()
    .enumerate()
    {
        if i > 0 {
            hasher.update(b"|");
        }
        if let Some(value) = headers.get(name) {
            hasher.update(value.as_bytes());
        }
    }
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Resolve the caller IP from proxy headers.
pub fn client_ip(headers: &HeaderMap, peer: Option<&str>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty()) {
            return first.to_string();
        }
    }

    header("x-real-ip")
        .or(peer)
        .unwrap_or(UNKNOWN_IP)
        .to_string()
}

/// Decides, per request, whether to allow, deny or challenge it.
///
/// The pipeline holds no per-request state. Everything shared lives in the
/// counter store; the policy set can be swapped while requests are in
/// flight.
pub struct Pipeline {
    config: GatekeeperConfig,
    store: Arc<dyn CounterStore>,
    policies: Arc<PolicyStore>,
    lists: ListGuard,
    limiter: RateLimiter,
    bots: BotScorer,
    metrics: AdmissionMetrics,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(config: GatekeeperConfig, store: Arc<dyn CounterStore>) -> Self {
        let policies = Arc::new(PolicyStore::new(config.rate_limiting.policies.clone()));
        let lists = ListGuard::new(config.lists.clone(), store.clone());
        let timeout = Duration::from_millis(config.store.timeout_ms.max(1));
        let limiter = RateLimiter::new(store.clone())
            .with_violation_logging(config.rate_limiting.log_violations)
            .with_store_timeout(timeout)
            .with_contention_wait(Duration::from_millis(config.store.contention_wait_ms.max(1)));
        let bots = BotScorer::new(config.bot_detection.clone(), store.clone());

        info!(
            backend = store.backend(),
            rate_limiting = config.rate_limiting.enabled,
            bot_detection = config.bot_detection.enabled,
            timeout_ms = timeout.as_millis() as u64,
            "Admission pipeline initialized"
        );

        Self {
            config,
            store,
            policies,
            lists,
            limiter,
            bots,
            metrics: AdmissionMetrics::new(),
            timeout,
        }
    }

    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    /// The live policy set.
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn metrics(&self) -> &AdmissionMetrics {
        &self.metrics
    }

    /// Decide on one request.
    ///
    /// Never fails: a store problem skips the affected stage and marks the
    /// admission as degraded. A rate limit key that stays contended is
    /// never skipped; the request is deferred with a short retry hint.
    #[instrument(skip(self, request), fields(ip = %request.ip, path = %request.path))]
    pub async fn admit(&self, request: &AdmissionRequest) -> Admission {
        let now = request.now;
        let user_id = request.user_id.as_deref().filter(|id| !id.is_empty());

        let mut admission = Admission {
            decision: Decision::Allow {
                remaining: None,
                reset_after: None,
            },
            limit: None,
            bot: None,
            stage: Stage::ListCheck,
            degraded: false,
            scope_key: None,
            evaluated_at: now,
        };

        if !self.lists.is_excluded(&request.path) {
            match self.guarded(self.lists.check(&request.ip, user_id, now)).await {
                Ok(ListStatus::Blacklisted { identifier }) => {
                    info!(identifier = %identifier, "Rejected blacklisted caller");
                    self.metrics.record_blacklisted();
                    admission.decision = Decision::Deny {
                        retry_after: None,
                        reason: DenyReason::Blacklisted,
                    };
                    return self.finish(admission);
                }
                Ok(ListStatus::Whitelisted { identifier }) => {
                    trace!(identifier = %identifier, "Whitelisted caller skips remaining checks");
                    self.metrics.record_whitelisted();
                    return self.finish(admission);
                }
                Ok(ListStatus::Unlisted) => {}
                Err(e) => self.fail_open(&mut admission, &e),
            }
        }

        admission.stage = Stage::RateCheck;
        if let Some((key, resolved)) = self.rate_target(request, user_id) {
            // The limiter bounds each of its own store calls.
            match self.limiter.check(&key, &resolved.policy, now).await {
                Ok(outcome) => {
                    admission.limit = Some(outcome.verdict);
                    if !outcome.verdict.allowed {
                        self.metrics.record_rate_limited();
                        admission.decision = Decision::Deny {
                            retry_after: outcome.verdict.retry_after,
                            reason: if outcome.blocked {
                                DenyReason::Blocked
                            } else {
                                DenyReason::RateLimited
                            },
                        };
                        admission.scope_key = Some(key);
                        return self.finish(admission);
                    }
                }
                Err(e) if e.is_contention() => {
                    warn!(key = %key, error = %e, "Rate limit key is contended, deferring request");
                    self.metrics.record_rate_limited();
                    admission.decision = Decision::Deny {
                        retry_after: Some(CONTENTION_RETRY_AFTER),
                        reason: DenyReason::RateLimited,
                    };
                    admission.scope_key = Some(key);
                    return self.finish(admission);
                }
                Err(e) => self.fail_open(&mut admission, &e),
            }
            admission.scope_key = Some(key);
        }

        admission.stage = Stage::BotCheck;
        if self.bots.config().enabled && !self.bots.is_excluded(&request.path) {
            let signal = self.score_bot(request, &mut admission).await;

            let action = match self.guarded(self.bots.escalate(&request.ip, &signal, now)).await {
                Ok(action) => action,
                Err(e) => {
                    self.fail_open(&mut admission, &e);
                    if signal.detected {
                        BotAction::Deny {
                            honeypot: signal.honeypot,
                        }
                    } else {
                        BotAction::Pass
                    }
                }
            };
            admission.bot = Some(signal);

            match action {
                BotAction::Deny { honeypot } => {
                    self.metrics.record_bot_denied();
                    admission.decision = Decision::Deny {
                        retry_after: None,
                        reason: if honeypot {
                            DenyReason::Honeypot
                        } else {
                            DenyReason::BotDetected
                        },
                    };
                    return self.finish(admission);
                }
                BotAction::Challenge => {
                    admission.decision = Decision::Challenge {
                        kind: ChallengeKind::Captcha,
                    };
                    return self.finish(admission);
                }
                BotAction::Pass => {}
            }
        }

        admission.stage = Stage::Decided;
        admission.decision = Decision::Allow {
            remaining: admission.limit.map(|v| v.remaining),
            reset_after: admission.limit.map(|v| v.reset_after),
        };
        self.finish(admission)
    }

    /// Status code and headers for an admission, honoring the debug
    /// header setting.
    pub fn render(&self, admission: &Admission) -> (StatusCode, HeaderMap) {
        (
            admission.status(),
            admission.headers(self.config.admission.debug_headers),
        )
    }

    /// The scope key and policy a request is counted under, or `None`
    /// when rate limiting doesn't apply to it.
    fn rate_target(
        &self,
        request: &AdmissionRequest,
        user_id: Option<&str>,
    ) -> Option<(ScopeKey, ResolvedPolicy)> {
        let settings = &self.config.rate_limiting;
        if !settings.enabled {
            return None;
        }
        if settings
            .exclude_paths
            .iter()
            .any(|prefix| request.path.starts_with(prefix.as_str()))
        {
            trace!("Path excluded from rate limiting");
            return None;
        }

        let default_scope = if user_id.is_some() {
            settings.authenticated_scope
        } else {
            settings.anonymous_scope
        };

        let resolved = self.policies.snapshot().resolve(&request.path, default_scope);
        if !resolved.policy.enabled {
            trace!(source = %resolved.source, "Policy disabled");
            return None;
        }

        let key = ScopeKey::resolve(resolved.scope, &request.ip, user_id, &request.path);
        trace!(key = %key, source = %resolved.source, "Resolved rate limit policy");
        Some((key, resolved))
    }

    /// Static checks plus timing; timing is dropped if the store fails.
    async fn score_bot(&self, request: &AdmissionRequest, admission: &mut Admission) -> BotSignal {
        let signal = self
            .bots
            .inspect(request.user_agent.as_deref(), &request.path);

        match self.guarded(self.bots.observe(&request.timing_identity(), request.now)).await {
            Ok(timing) => self.bots.with_timing(signal, &timing),
            Err(e) => {
                self.fail_open(admission, &e);
                signal
            }
        }
    }

    async fn guarded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(self.timeout)))
    }

    fn fail_open(&self, admission: &mut Admission, error: &StoreError) {
        warn!(
            stage = %admission.stage,
            backend = self.store.backend(),
            error = %error,
            "Counter store failed, skipping stage"
        );
        admission.degraded = true;
        self.metrics.record_fail_open();
    }

    fn finish(&self, admission: Admission) -> Admission {
        match admission.decision {
            Decision::Allow { .. } => self.metrics.record_allowed(),
            Decision::Deny { .. } => self.metrics.record_denied(),
            Decision::Challenge { .. } => self.metrics.record_challenged(),
        }

        debug!(
            stage = %admission.stage,
            status = admission.status().as_u16(),
            degraded = admission.degraded,
            "Admission decided"
        );
        admission
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("store", &self.store.backend())
            .field("timeout", &self.timeout)
            .field("lists", &self.lists)
            .field("limiter", &self.limiter)
            .field("bots", &self.bots)
            .finish()
    }
}
