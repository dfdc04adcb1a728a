//! Behavioral bot detection.
//!
//! Scores a request from its User-Agent, its path (honeypot decoys) and the
//! timing of the caller's recent requests. The score is advisory until it
//! crosses the configured thresholds; escalation turns it into a challenge
//! or a deny.

mod scorer;
pub mod timing;
pub mod user_agent;

pub use scorer::BotScorer;
pub use timing::TimingAnalysis;
pub use user_agent::{analyze_user_agent, honeypot_match, UserAgentAnalysis};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::BotDetectionConfig;

/// Discrete classification of a [`BotSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotClass {
    Normal,
    Suspicious,
    ConfirmedBot,
}

impl fmt::Display for BotClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BotClass::Normal => "normal",
            BotClass::Suspicious => "suspicious",
            BotClass::ConfirmedBot => "confirmed_bot",
        })
    }
}

/// The bot scorer's view of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotSignal {
    pub score: u32,
    pub suspicious: bool,
    pub detected: bool,
    /// The request hit a honeypot decoy
    pub honeypot: bool,
    /// What contributed to the score
    pub reasons: BTreeSet<String>,
}

impl BotSignal {
    pub fn class(&self) -> BotClass {
        if self.detected {
            BotClass::ConfirmedBot
        } else if self.suspicious {
            BotClass::Suspicious
        } else {
            BotClass::Normal
        }
    }

    pub(crate) fn add(&mut self, weight: u32, reason: impl Into<String>) {
        if weight == 0 {
            return;
        }
        self.score += weight;
        self.reasons.insert(reason.into());
    }

    pub(crate) fn classify(&mut self, config: &BotDetectionConfig) {
        self.suspicious = self.score >= config.suspicious_threshold;
        self.detected = self.score >= config.detection_threshold || self.honeypot;
    }
}

/// What the admission pipeline should do about a scored request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotAction {
    /// Let the request through (the signal stays advisory)
    Pass,
    /// Ask the caller to solve a captcha
    Challenge,
    /// Reject the request
    Deny { honeypot: bool },
}
