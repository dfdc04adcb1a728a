//! Admission decisions and their rendering as HTTP response metadata.

use std::fmt;

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::bot::BotSignal;
use crate::ratelimit::{ScopeKey, Verdict};
use crate::time::Timestamp;

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_RATELIMIT_RESET_AFTER: HeaderName = HeaderName::from_static("x-ratelimit-reset-after");
const X_BLOCK_REASON: HeaderName = HeaderName::from_static("x-block-reason");
const X_CHALLENGE_REQUIRED: HeaderName = HeaderName::from_static("x-challenge-required");
const X_BOT_DETECTED: HeaderName = HeaderName::from_static("x-bot-detected");
const X_BOT_SCORE: HeaderName = HeaderName::from_static("x-bot-score");
const X_BOT_SUSPICIOUS: HeaderName = HeaderName::from_static("x-bot-suspicious");

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blacklisted,
    RateLimited,
    /// Still on hold from an earlier rate limit violation
    Blocked,
    BotDetected,
    Honeypot,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Blacklisted => "blacklisted",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::Blocked => "blocked",
            DenyReason::BotDetected => "bot_detected",
            DenyReason::Honeypot => "honeypot",
        }
    }

    /// HTTP status for a deny with this reason.
    pub fn status(&self) -> StatusCode {
        match self {
            DenyReason::Blacklisted | DenyReason::Honeypot => StatusCode::FORBIDDEN,
            DenyReason::RateLimited | DenyReason::Blocked | DenyReason::BotDetected => {
                StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of challenge a caller has to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Captcha,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Captcha => "captcha",
        }
    }
}

/// The outcome for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// `remaining` and `reset_after` are absent when no rate check ran
    Allow {
        remaining: Option<u64>,
        reset_after: Option<u64>,
    },
    Deny {
        retry_after: Option<u64>,
        reason: DenyReason,
    },
    Challenge { kind: ChallengeKind },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// The pipeline stage that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ListCheck,
    RateCheck,
    BotCheck,
    /// Every stage passed
    Decided,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ListCheck => "list_check",
            Stage::RateCheck => "rate_check",
            Stage::BotCheck => "bot_check",
            Stage::Decided => "decided",
        })
    }
}

/// Everything the pipeline knows about one admitted (or rejected) request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    #[serde(flatten)]
    pub decision: Decision,
    /// The rate limit verdict, when a rate check ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot: Option<BotSignal>,
    pub stage: Stage,
    /// A stage failed open because the store was unavailable
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<ScopeKey>,
    pub evaluated_at: Timestamp,
}

impl Admission {
    pub fn status(&self) -> StatusCode {
        match self.decision {
            Decision::Allow { .. } => StatusCode::OK,
            Decision::Deny { reason, .. } => reason.status(),
            Decision::Challenge { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Response headers for this admission.
    ///
    /// `debug_bot_headers` adds the raw bot score to every response that
    /// went through bot scoring.
    pub fn headers(&self, debug_bot_headers: bool) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply_to(&mut headers, debug_bot_headers);
        headers
    }

    /// Write this admission's headers into an existing map.
    pub fn apply_to(&self, headers: &mut HeaderMap, debug_bot_headers: bool) {
        if let Some(verdict) = &self.limit {
            let reset_at = (self.evaluated_at.as_secs().floor() as u64).saturating_add(verdict.reset_after);
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(verdict.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(verdict.remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
            headers.insert(X_RATELIMIT_RESET_AFTER, HeaderValue::from(verdict.reset_after));
        }

        match self.decision {
            Decision::Allow { .. } => {}
            Decision::Deny { retry_after, reason } => {
                if let Some(retry_after) = retry_after {
                    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
                }
                headers.insert(X_BLOCK_REASON, HeaderValue::from_static(reason.as_str()));
            }
            Decision::Challenge { kind } => {
                headers.insert(X_CHALLENGE_REQUIRED, HeaderValue::from_static(kind.as_str()));
            }
        }

        if let Some(bot) = &self.bot {
            if bot.detected {
                headers.insert(X_BOT_DETECTED, HeaderValue::from_static("true"));
            }
            if debug_bot_headers {
                headers.insert(X_BOT_SCORE, HeaderValue::from(bot.score));
                headers.insert(
                    X_BOT_SUSPICIOUS,
                    HeaderValue::from_static(if bot.suspicious { "true" } else { "false" }),
                );
            }
        }
    }
}
