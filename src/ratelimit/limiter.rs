//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, trace};

use crate::store::{CounterState, CounterStore, StoreError, StoreResult};
use crate::time::{ceil_secs, Timestamp};

use super::algorithm::{self, Verdict};
use super::policy::Policy;
use super::scope::ScopeKey;

/// Default bound for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Default bound for waiting behind same-key updates from this process.
pub const DEFAULT_CONTENTION_WAIT: Duration = Duration::from_millis(250);

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateOutcome {
    pub verdict: Verdict,
    /// Denied because an earlier violation put the key on hold
    pub blocked: bool,
}

/// Applies policies to scope keys using a shared counter store.
///
/// The limiter itself holds no counters; every check is one atomic
/// read-modify-write against the store, so instances sharing a store
/// share their limits. Checks for the same key issued by this process
/// take turns, so a compare-and-swap backend only races other instances.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    queue: UpdateQueue,
    store_timeout: Duration,
    contention_wait: Duration,
    log_violations: bool,
}

impl RateLimiter {
    /// Create a new rate limiter on top of `store`.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            queue: UpdateQueue::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            contention_wait: DEFAULT_CONTENTION_WAIT,
            log_violations: true,
        }
    }

    /// Log each denied request at info level (debug otherwise).
    pub fn with_violation_logging(mut self, enabled: bool) -> Self {
        self.log_violations = enabled;
        self
    }

    /// Bound every store call made by a check.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Bound the wait for this key's turn. A check that runs out of it
    /// fails with [`StoreError::Busy`].
    pub fn with_contention_wait(mut self, wait: Duration) -> Self {
        self.contention_wait = wait;
        self
    }

    /// Count one request for `key` under `policy`.
    #[instrument(skip(self, key, policy), fields(key = %key, algorithm = %policy.algorithm))]
    pub async fn check(
        &self,
        key: &ScopeKey,
        policy: &Policy,
        now: Timestamp,
    ) -> StoreResult<RateOutcome> {
        if policy.block_duration > 0 {
            if let Some(outcome) = self.bounded(self.active_block(key, policy, now)).await? {
                return Ok(outcome);
            }
        }

        let _turn = self.queue.enter(key.as_str(), self.contention_wait).await?;

        let mut verdict = None;
        let mut apply = |state: Option<&CounterState>| {
            let (next, v) = algorithm::step(policy, state, now);
            verdict = Some(v);
            next
        };
        self.bounded(
            self.store
                .update(key.as_str(), policy.state_ttl(), now, &mut apply),
        )
        .await?;

        let mut verdict = verdict.ok_or_else(|| {
            StoreError::Unavailable(format!("update of {} returned without applying", key))
        })?;

        trace!(
            allowed = verdict.allowed,
            remaining = verdict.remaining,
            "Rate limit step applied"
        );

        if !verdict.allowed {
            if policy.block_duration > 0 {
                let until = now + policy.block_duration as f64;
                self.bounded(self.store.write(
                    &key.block_key(),
                    &CounterState::Hold { until },
                    Duration::from_secs(policy.block_duration),
                    now,
                ))
                .await?;

                verdict.retry_after = verdict
                    .retry_after
                    .map(|retry| retry.max(policy.block_duration));
            }

            if self.log_violations {
                info!(
                    limit = verdict.limit,
                    retry_after = ?verdict.retry_after,
                    block_duration = policy.block_duration,
                    "Rate limit exceeded"
                );
            } else {
                debug!(limit = verdict.limit, "Rate limit exceeded");
            }
        }

        Ok(RateOutcome {
            verdict,
            blocked: false,
        })
    }

    /// A deny for a key still on hold from an earlier violation.
    async fn active_block(
        &self,
        key: &ScopeKey,
        policy: &Policy,
        now: Timestamp,
    ) -> StoreResult<Option<RateOutcome>> {
        let stored = self.store.read(&key.block_key(), now).await?;

        match stored.map(|s| s.state) {
            Some(CounterState::Hold { until }) if now < until => {
                let retry = ceil_secs(until.as_secs() - now.as_secs()).max(1);
                debug!(retry_after = retry, "Key is blocked");
                Ok(Some(RateOutcome {
                    verdict: Verdict {
                        allowed: false,
                        limit: policy.limit(),
                        remaining: 0,
                        reset_after: retry,
                        retry_after: Some(retry),
                    },
                    blocked: true,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn bounded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(self.store_timeout)))
    }
}

/// One FIFO lock per key with updates in flight.
#[derive(Default)]
struct UpdateQueue {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl UpdateQueue {
    async fn enter(&self, key: &str, wait: Duration) -> StoreResult<UpdateTurn<'_>> {
        let slot = self.slots.entry(key.to_string()).or_default().clone();

        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => Ok(UpdateTurn {
                queue: self,
                key: key.to_string(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(key);
                Err(StoreError::Busy {
                    key: key.to_string(),
                    waited: wait,
                })
            }
        }
    }

    /// Drop the slot once nobody holds or waits for it.
    fn release(&self, key: &str) {
        self.slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

struct UpdateTurn<'a> {
    queue: &'a UpdateQueue,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UpdateTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.queue.release(&self.key);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.backend())
            .field("store_timeout", &self.store_timeout)
            .field("contention_wait", &self.contention_wait)
            .field("keys_in_flight", &self.queue.len())
            .field("log_violations", &self.log_violations)
            .finish()
    }
}
