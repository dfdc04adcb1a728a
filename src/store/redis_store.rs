//! Redis-backed counter store for multi-instance deployments.
//!
//! Every mutating operation is a single round trip: increments and
//! compare-and-swap run as Lua scripts, so concurrent instances hitting the
//! same key are serialized by Redis itself. A lost compare-and-swap returns
//! the winning state in the same reply, so a retry costs one round trip.
//!
//! Key layout (all under the configured prefix):
//! - `state:<key>`: hash with `s` (JSON state) and `v` (version)
//! - `count:<key>`: plain integer counter
//! - `list:<whitelist|blacklist>:<identifier>`: JSON list entry
//! - `versions`: store-wide version sequence

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info, trace};

use super::{
    CounterState, CounterStore, ListEntry, ListKind, StateUpdate, StoreError, StoreResult,
    StoredState, MAX_CAS_ATTEMPTS,
};
use crate::time::Timestamp;

/// INCRBY + PEXPIRE in one step; the expiry is only set when the counter is
/// created so it spans a fixed period from the first hit.
const INCREMENT_SCRIPT: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if value == tonumber(ARGV[1]) then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

/// Replace the state only if the stored version matches ARGV[1]
/// (empty string: only if absent).
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] == '' then
    if current then
        return 0
    end
elseif current ~= ARGV[1] then
    return 0
end
local version = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 's', ARGV[2], 'v', version)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

/// Like the compare-and-swap script, but a mismatch replies with the
/// current `{0, state, version}` (nil fields when absent).
const SWAP_OR_CURRENT_SCRIPT: &str = r#"
local current = redis.call('HMGET', KEYS[1], 's', 'v')
local matches
if ARGV[1] == '' then
    matches = not current[2]
else
    matches = current[2] == ARGV[1]
end
if not matches then
    return {0, current[1], current[2]}
end
local version = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 's', ARGV[2], 'v', version)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return {1, false, false}
"#;

const WRITE_SCRIPT: &str = r#"
local version = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 's', ARGV[1], 'v', version)
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return version
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix applied to every key (default: "gatekeeper:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "gatekeeper:".to_string(),
        }
    }
}

/// Counter store shared by all instances through Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    increment_script: Script,
    compare_and_swap_script: Script,
    swap_or_current_script: Script,
    write_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with the default configuration.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with a custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(prefix = %config.key_prefix, "Connected Redis counter store");

        Ok(Self {
            connection,
            config,
            increment_script: Script::new(INCREMENT_SCRIPT),
            compare_and_swap_script: Script::new(COMPARE_AND_SWAP_SCRIPT),
            swap_or_current_script: Script::new(SWAP_OR_CURRENT_SCRIPT),
            write_script: Script::new(WRITE_SCRIPT),
        })
    }

    fn state_key(&self, key: &str) -> String {
        format!("{}state:{}", self.config.key_prefix, key)
    }

    fn count_key(&self, key: &str) -> String {
        format!("{}count:{}", self.config.key_prefix, key)
    }

    fn versions_key(&self) -> String {
        format!("{}versions", self.config.key_prefix)
    }

    fn list_prefix(&self, list: ListKind) -> String {
        format!("{}list:{}:", self.config.key_prefix, list)
    }

    fn list_key(&self, list: ListKind, identifier: &str) -> String {
        format!("{}{}", self.list_prefix(list), identifier)
    }

    async fn get_entry(&self, list: ListKind, identifier: &str) -> StoreResult<Option<ListEntry>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.list_key(list, identifier))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
        _now: Timestamp,
    ) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        let value: u64 = self
            .increment_script
            .key(self.count_key(key))
            .arg(amount)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn read(&self, key: &str, _now: Timestamp) -> StoreResult<Option<StoredState>> {
        let mut conn = self.connection.clone();
        let (state, version): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.state_key(key))
            .arg("s")
            .arg("v")
            .query_async(&mut conn)
            .await?;

        match (state, version) {
            (Some(state), Some(version)) => Ok(Some(StoredState {
                state: serde_json::from_str(&state)?,
                version,
            })),
            _ => Ok(None),
        }
    }

    async fn write(
        &self,
        key: &str,
        state: &CounterState,
        ttl: Duration,
        _now: Timestamp,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(state)?;
        let mut conn = self.connection.clone();
        let _version: u64 = self
            .write_script
            .key(self.state_key(key))
            .key(self.versions_key())
            .arg(payload)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
        _now: Timestamp,
    ) -> StoreResult<bool> {
        let payload = serde_json::to_string(state)?;
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let mut conn = self.connection.clone();
        let applied: i64 = self
            .compare_and_swap_script
            .key(self.state_key(key))
            .key(self.versions_key())
            .arg(expected)
            .arg(payload)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
        f: &mut StateUpdate<'_>,
    ) -> StoreResult<CounterState> {
        let mut current = self.read(key, now).await?;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (expected, state) = match current {
                Some(stored) => (Some(stored.version), Some(stored.state)),
                None => (None, None),
            };

            let next = f(state.as_ref());
            let payload = serde_json::to_string(&next)?;
            let mut conn = self.connection.clone();
            let (applied, latest_state, latest_version): (i64, Option<String>, Option<u64>) = self
                .swap_or_current_script
                .key(self.state_key(key))
                .key(self.versions_key())
                .arg(expected.map(|v| v.to_string()).unwrap_or_default())
                .arg(payload)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await?;

            if applied == 1 {
                return Ok(next);
            }

            current = match (latest_state, latest_version) {
                (Some(state), Some(version)) => Some(StoredState {
                    state: serde_json::from_str(&state)?,
                    version,
                }),
                _ => None,
            };
            trace!(key = %key, attempt = attempt, "Lost a compare-and-swap to another instance");
        }

        Err(StoreError::Contention {
            key: key.to_string(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    async fn list_add(&self, list: ListKind, entry: ListEntry) -> StoreResult<()> {
        let key = self.list_key(list, &entry.identifier);
        let payload = serde_json::to_string(&entry)?;
        let mut conn = self.connection.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(payload);
        if let Some(ttl) = entry.ttl_remaining(entry.created_at) {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;

        debug!(list = %list, identifier = %entry.identifier, "Added list entry");
        Ok(())
    }

    async fn list_remove(&self, list: ListKind, identifier: &str) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.list_key(list, identifier))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn list_contains(
        &self,
        list: ListKind,
        identifier: &str,
        now: Timestamp,
    ) -> StoreResult<bool> {
        Ok(self
            .get_entry(list, identifier)
            .await?
            .map(|entry| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn list_entries(&self, list: ListKind, now: Timestamp) -> StoreResult<Vec<ListEntry>> {
        let pattern = format!("{}*", self.list_prefix(list));
        let mut conn = self.connection.clone();
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(values.len());
        for raw in values.into_iter().flatten() {
            let entry: ListEntry = serde_json::from_str(&raw)?;
            if entry.is_live(now) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
    }

    async fn test_store(prefix: &str) -> RedisStore {
        let config = RedisStoreConfig {
            key_prefix: format!("gatekeeper-test:{}:{}:", prefix, std::process::id()),
        };
        RedisStore::connect_with_config(&redis_url(), config)
            .await
            .expect("Failed to connect to Redis")
    }

    #[test]
    fn test_key_layout() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.key_prefix, "gatekeeper:");
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::from_secs(u64::MAX)), u64::MAX);
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_redis_increment_and_cas() {
        let store = test_store("cas").await;
        let now = Timestamp::now();
        let ttl = Duration::from_secs(30);

        assert_eq!(store.increment_and_get("hits", 2, ttl, now).await.unwrap(), 2);
        assert_eq!(store.increment_and_get("hits", 3, ttl, now).await.unwrap(), 5);

        let state = CounterState::FixedWindow { count: 1, window_start: now };
        assert!(store.compare_and_swap("fw", None, &state, ttl, now).await.unwrap());
        assert!(!store.compare_and_swap("fw", None, &state, ttl, now).await.unwrap());

        let stored = store.read("fw", now).await.unwrap().unwrap();
        assert_eq!(stored.state, state);

        let next = CounterState::FixedWindow { count: 2, window_start: now };
        assert!(store
            .compare_and_swap("fw", Some(stored.version), &next, ttl, now)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("fw", Some(stored.version), &next, ttl, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_redis_concurrent_updates_are_not_lost() {
        let store = std::sync::Arc::new(test_store("update").await);
        let now = Timestamp::now();
        let ttl = Duration::from_secs(30);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut bump = |current: Option<&CounterState>| {
                        let count = match current {
                            Some(CounterState::FixedWindow { count, .. }) => *count,
                            _ => 0,
                        };
                        CounterState::FixedWindow { count: count + 1, window_start: now }
                    };
                    store.update("fw", ttl, now, &mut bump).await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.read("fw", now).await.unwrap().unwrap();
        assert_eq!(stored.state, CounterState::FixedWindow { count: 50, window_start: now });
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_redis_lists() {
        let store = test_store("lists").await;
        let now = Timestamp::now();

        store
            .list_add(ListKind::Blacklist, ListEntry::new("198.51.100.7", now, Some(Duration::from_secs(60))))
            .await
            .unwrap();

        assert!(store.list_contains(ListKind::Blacklist, "198.51.100.7", now).await.unwrap());
        assert!(!store.list_contains(ListKind::Whitelist, "198.51.100.7", now).await.unwrap());
        assert_eq!(store.list_entries(ListKind::Blacklist, now).await.unwrap().len(), 1);
        assert!(store.list_remove(ListKind::Blacklist, "198.51.100.7").await.unwrap());
    }
}
