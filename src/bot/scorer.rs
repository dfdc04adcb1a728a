//! The bot scorer: combines static checks and timing into a [`BotSignal`]
//! and decides how to escalate.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::config::BotDetectionConfig;
use crate::store::{CounterState, CounterStore, StoreResult};
use crate::time::Timestamp;

use super::timing::{self, TimingAnalysis};
use super::user_agent::{analyze_user_agent, honeypot_match};
use super::{BotAction, BotSignal};

/// Heuristic bot detection over a shared counter store.
pub struct BotScorer {
    config: BotDetectionConfig,
    store: Arc<dyn CounterStore>,
}

impl BotScorer {
    pub fn new(config: BotDetectionConfig, store: Arc<dyn CounterStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &BotDetectionConfig {
        &self.config
    }

    /// Whether `path` is excluded from bot scoring.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.config
            .exclude_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Score the parts of a request that need no history: the User-Agent
    /// header and the path.
    pub fn inspect(&self, user_agent: Option<&str>, path: &str) -> BotSignal {
        let mut signal = BotSignal::default();

        let ua = analyze_user_agent(user_agent, &self.config);
        for signature in &ua.matches {
            signal.add(self.config.ua_match_weight, format!("user_agent:{}", signature));
        }
        if ua.missing {
            signal.add(self.config.missing_user_agent_weight, "missing_user_agent");
        }

        if let Some(decoy) = honeypot_match(path, &self.config) {
            signal.honeypot = true;
            signal.add(self.config.honeypot_weight, format!("honeypot:{}", decoy));
        }

        signal.classify(&self.config);
        signal
    }

    /// Fold a timing analysis into a signal and re-derive its flags.
    pub fn with_timing(&self, mut signal: BotSignal, timing: &TimingAnalysis) -> BotSignal {
        if timing.regular {
            signal.add(self.config.regularity_weight, "regular_intervals");
        }
        if timing.fast_intervals > 0 {
            signal.add(
                timing.fast_intervals.min(self.config.max_fast_requests) * self.config.fast_request_weight,
                "fast_requests",
            );
        }
        if timing.minute_burst {
            signal.add(self.config.minute_burst_weight, "minute_burst");
        }
        if timing.second_burst {
            signal.add(self.config.second_burst_weight, "second_burst");
        }

        signal.classify(&self.config);
        signal
    }

    /// Record this request in the identifier's history and analyze the
    /// caller's recent timing.
    #[instrument(skip(self))]
    pub async fn observe(&self, identifier: &str, now: Timestamp) -> StoreResult<TimingAnalysis> {
        let mut history = Vec::new();
        let mut apply = |state: Option<&CounterState>| {
            history = timing::record(state, now, &self.config);
            CounterState::RequestHistory {
                timestamps: history.clone(),
            }
        };

        self.store
            .update(
                &history_key(identifier),
                timing::history_ttl(&self.config),
                now,
                &mut apply,
            )
            .await?;

        Ok(timing::analyze(&history, now, &self.config))
    }

    /// Full score for one request: static checks plus timing.
    pub async fn score(
        &self,
        identifier: &str,
        user_agent: Option<&str>,
        path: &str,
        now: Timestamp,
    ) -> StoreResult<BotSignal> {
        let signal = self.inspect(user_agent, path);
        let timing = self.observe(identifier, now).await?;
        Ok(self.with_timing(signal, &timing))
    }

    /// Decide what to do with a scored request.
    ///
    /// A detected bot is denied and marked for challenges. A suspicious one
    /// collects a strike; enough strikes lead to a challenge and then a
    /// deny. A live challenge marker challenges every suspicious request.
    #[instrument(skip(self, signal), fields(score = signal.score))]
    pub async fn escalate(
        &self,
        identifier: &str,
        signal: &BotSignal,
        now: Timestamp,
    ) -> StoreResult<BotAction> {
        let config = &self.config;

        if signal.detected {
            info!(
                identifier = %identifier,
                honeypot = signal.honeypot,
                reasons = ?signal.reasons,
                "Bot detected"
            );

            if config.enable_challenge && config.challenge_window_secs > 0 {
                self.store
                    .write(
                        &challenge_key(identifier),
                        &CounterState::Hold {
                            until: now + config.challenge_window_secs as f64,
                        },
                        Duration::from_secs(config.challenge_window_secs),
                        now,
                    )
                    .await?;
            }

            return Ok(BotAction::Deny {
                honeypot: signal.honeypot,
            });
        }

        if !signal.suspicious {
            return Ok(BotAction::Pass);
        }

        let strikes = self
            .store
            .increment_and_get(
                &strikes_key(identifier),
                1,
                Duration::from_secs(config.strike_window_secs.max(1)),
                now,
            )
            .await?;

        debug!(identifier = %identifier, strikes, "Suspicious request");

        if config.deny_after_strikes > 0 && strikes >= config.deny_after_strikes {
            return Ok(BotAction::Deny { honeypot: false });
        }

        if config.enable_challenge {
            let marked = matches!(
                self.store.read(&challenge_key(identifier), now).await?.map(|s| s.state),
                Some(CounterState::Hold { until }) if now < until
            );
            if marked || strikes >= config.challenge_after_strikes {
                return Ok(BotAction::Challenge);
            }
        }

        Ok(BotAction::Pass)
    }
}

impl std::fmt::Debug for BotScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotScorer")
            .field("enabled", &self.config.enabled)
            .field("store", &self.store.backend())
            .finish()
    }
}

fn history_key(identifier: &str) -> String {
    format!("bot:history:{}", identifier)
}

fn strikes_key(identifier: &str) -> String {
    format!("bot:strikes:{}", identifier)
}

fn challenge_key(identifier: &str) -> String {
    format!("bot:challenge:{}", identifier)
}
