//! Counter store abstraction shared by the rate limiter, the list guard and
//! the bot scorer.
//!
//! The store is the only shared mutable resource in the admission layer.
//! Every component goes through the atomic contract defined by
//! [`CounterStore`]; nothing performs its own read-modify-write against a
//! backend.

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;
#[cfg(feature = "sql-store")]
mod sql_store;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisStore, RedisStoreConfig};
#[cfg(feature = "sql-store")]
pub use sql_store::SqlStore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::config::{StoreBackend, StoreConfig};
use crate::time::Timestamp;

/// Maximum compare-and-swap attempts before an update gives up.
pub const MAX_CAS_ATTEMPTS: u32 = 32;

/// Errors raised by counter store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("gave up updating {key} after {attempts} contended attempts")]
    Contention { key: String, attempts: u32 },
    #[error("waited {waited:?} behind earlier updates of {key}")]
    Busy { key: String, waited: Duration },
    #[error("failed to (de)serialize counter state: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[cfg(feature = "sql-store")]
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl StoreError {
    /// The store is reachable but other writers kept the key busy.
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention { .. } | StoreError::Busy { .. })
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Algorithm-specific state kept per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterState {
    TokenBucket {
        tokens: f64,
        last_refill: Timestamp,
    },
    SlidingWindow {
        prev_count: u64,
        curr_count: u64,
        window_start: Timestamp,
    },
    FixedWindow {
        count: u64,
        window_start: Timestamp,
    },
    /// Recent request timestamps for one identifier, oldest first.
    RequestHistory { timestamps: Vec<Timestamp> },
    /// A hold (violator block or challenge escalation) in force until the
    /// given instant.
    Hold { until: Timestamp },
}

/// A state together with the version used for compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredState {
    pub state: CounterState,
    pub version: u64,
}

/// A state transition applied atomically by [`CounterStore::update`].
///
/// The closure may run more than once when a backend has to retry a
/// compare-and-swap, so it must be free of side effects other than
/// recording its latest output.
pub type StateUpdate<'a> = dyn FnMut(Option<&CounterState>) -> CounterState + Send + 'a;

/// The two administrative lists consulted by the list guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Whitelist => "whitelist",
            ListKind::Blacklist => "blacklist",
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A whitelist or blacklist entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    /// IP address or user id
    pub identifier: String,
    /// When the entry was added
    pub created_at: Timestamp,
    /// When the entry stops applying; `None` means permanent
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}

impl ListEntry {
    /// Create an entry added at `now`, optionally expiring after `ttl`.
    pub fn new(identifier: impl Into<String>, now: Timestamp, ttl: Option<Duration>) -> Self {
        Self {
            identifier: identifier.into(),
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    /// Whether the entry still applies at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }

    /// Time left before expiry, if the entry expires at all.
    pub fn ttl_remaining(&self, now: Timestamp) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| Duration::from_secs_f64(expires_at.secs_since(now)))
    }
}

/// Trait for counter store backends.
///
/// All operations receive the pipeline's `now`. The in-process and SQL
/// backends evaluate expiry against it; Redis additionally relies on its
/// own key expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name used in logs.
    fn backend(&self) -> &'static str;

    /// Atomically add `amount` to a plain counter and return the new value.
    ///
    /// The TTL is applied when the counter is created (or recreated after
    /// expiry), so the counter covers a fixed span from its first hit.
    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<u64>;

    /// Read the live state stored under `key`.
    async fn read(&self, key: &str, now: Timestamp) -> StoreResult<Option<StoredState>>;

    /// Atomically replace the state stored under `key`.
    async fn write(
        &self,
        key: &str,
        state: &CounterState,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<()>;

    /// Replace the state under `key` only if its version still matches.
    ///
    /// `expected = None` means "only if no live state exists".
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<bool>;

    /// Linearizable read-modify-write of the state under `key`.
    ///
    /// The default implementation retries [`compare_and_swap`] until it
    /// wins or [`MAX_CAS_ATTEMPTS`] is reached.
    ///
    /// [`compare_and_swap`]: CounterStore::compare_and_swap
    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
        f: &mut StateUpdate<'_>,
    ) -> StoreResult<CounterState> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.read(key, now).await?;
            let (expected, state) = match current {
                Some(stored) => (Some(stored.version), Some(stored.state)),
                None => (None, None),
            };

            let next = f(state.as_ref());
            if self.compare_and_swap(key, expected, &next, ttl, now).await? {
                return Ok(next);
            }

            trace!(key = %key, attempt = attempt, "Compare-and-swap lost a race, retrying");
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Add (or replace) an entry on a list.
    async fn list_add(&self, list: ListKind, entry: ListEntry) -> StoreResult<()>;

    /// Remove an entry; returns whether it was present.
    async fn list_remove(&self, list: ListKind, identifier: &str) -> StoreResult<bool>;

    /// Whether a live entry exists for `identifier`.
    async fn list_contains(
        &self,
        list: ListKind,
        identifier: &str,
        now: Timestamp,
    ) -> StoreResult<bool>;

    /// All live entries on a list, sorted by identifier.
    async fn list_entries(&self, list: ListKind, now: Timestamp) -> StoreResult<Vec<ListEntry>>;
}

/// Open the backend selected by `config`.
pub async fn open(config: &StoreConfig) -> StoreResult<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs.max(1)));
            Ok(store)
        }

        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let url = required_url(config)?;
            let redis_config = RedisStoreConfig {
                key_prefix: config.key_prefix.clone(),
            };
            Ok(Arc::new(RedisStore::connect_with_config(url, redis_config).await?))
        }

        #[cfg(feature = "sql-store")]
        StoreBackend::Sql => {
            let url = required_url(config)?;
            Ok(Arc::new(SqlStore::connect(url, config.max_connections).await?))
        }

        #[allow(unreachable_patterns)]
        backend => Err(StoreError::Unavailable(format!(
            "the {:?} backend is not compiled in (enable its cargo feature)",
            backend
        ))),
    }
}

#[cfg(any(feature = "redis-store", feature = "sql-store"))]
fn required_url(config: &StoreConfig) -> StoreResult<&str> {
    config
        .url
        .as_deref()
        .ok_or_else(|| StoreError::Unavailable(format!("store.url is required for {:?}", config.backend)))
}
