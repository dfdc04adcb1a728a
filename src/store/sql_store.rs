//! SQLite-backed counter store.
//!
//! Counters survive restarts and can be shared by processes on one host.
//! Read-modify-write updates run in a transaction that holds the database
//! write lock from its first statement, so concurrent updaters queue on
//! SQLite's busy timeout instead of losing compare-and-swap races.
//! Expiry is evaluated against the caller's `now`; expired rows are ignored
//! by reads and replaced by writes, and [`SqlStore::purge_expired`] removes
//! them for good.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE gatekeeper_counters (
//!     key TEXT PRIMARY KEY,
//!     state TEXT NOT NULL,
//!     version INTEGER NOT NULL,
//!     expires_at REAL NOT NULL
//! );
//! CREATE TABLE gatekeeper_tallies (
//!     key TEXT PRIMARY KEY,
//!     value INTEGER NOT NULL,
//!     expires_at REAL NOT NULL
//! );
//! CREATE TABLE gatekeeper_list_entries (
//!     list TEXT NOT NULL,
//!     identifier TEXT NOT NULL,
//!     created_at REAL NOT NULL,
//!     expires_at REAL,
//!     PRIMARY KEY (list, identifier)
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use super::{CounterState, CounterStore, ListEntry, ListKind, StateUpdate, StoreResult, StoredState};
use crate::time::Timestamp;

const CREATE_COUNTERS: &str = "CREATE TABLE IF NOT EXISTS gatekeeper_counters (
    key TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    version INTEGER NOT NULL,
    expires_at REAL NOT NULL
)";

const CREATE_TALLIES: &str = "CREATE TABLE IF NOT EXISTS gatekeeper_tallies (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL,
    expires_at REAL NOT NULL
)";

const CREATE_LIST_ENTRIES: &str = "CREATE TABLE IF NOT EXISTS gatekeeper_list_entries (
    list TEXT NOT NULL,
    identifier TEXT NOT NULL,
    created_at REAL NOT NULL,
    expires_at REAL,
    PRIMARY KEY (list, identifier)
)";

/// Counter store persisted in SQLite.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    /// Connect to `url` and create the tables if needed.
    ///
    /// In-memory databases (`sqlite::memory:`) are limited to one pooled
    /// connection, since every connection would otherwise see its own
    /// empty database.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self::from_pool(pool);
        store.create_tables().await?;

        info!(url = %url, max_connections, "Connected SQL counter store");
        Ok(store)
    }

    /// Wrap an existing pool. Call [`create_tables`](Self::create_tables)
    /// before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the store's tables if they do not exist.
    pub async fn create_tables(&self) -> StoreResult<()> {
        for statement in [CREATE_COUNTERS, CREATE_TALLIES, CREATE_LIST_ENTRIES] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Delete every row that has expired at `now`. Returns the number of
    /// rows removed.
    pub async fn purge_expired(&self, now: Timestamp) -> StoreResult<u64> {
        let mut removed = 0;

        removed += sqlx::query("DELETE FROM gatekeeper_counters WHERE expires_at <= ?1")
            .bind(now.as_secs())
            .execute(&self.pool)
            .await?
            .rows_affected();

        removed += sqlx::query("DELETE FROM gatekeeper_tallies WHERE expires_at <= ?1")
            .bind(now.as_secs())
            .execute(&self.pool)
            .await?
            .rows_affected();

        removed += sqlx::query(
            "DELETE FROM gatekeeper_list_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(now.as_secs())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed > 0 {
            debug!(removed, "Purged expired rows");
        }
        Ok(removed)
    }
}

#[async_trait]
impl CounterStore for SqlStore {
    fn backend(&self) -> &'static str {
        "sql"
    }

    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<u64> {
        let row = sqlx::query(
            "INSERT INTO gatekeeper_tallies (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = CASE WHEN gatekeeper_tallies.expires_at <= ?4
                              THEN excluded.value
                              ELSE gatekeeper_tallies.value + excluded.value END,
                 expires_at = CASE WHEN gatekeeper_tallies.expires_at <= ?4
                                   THEN excluded.expires_at
                                   ELSE gatekeeper_tallies.expires_at END
             RETURNING value",
        )
        .bind(key)
        .bind(amount as i64)
        .bind((now + ttl).as_secs())
        .bind(now.as_secs())
        .fetch_one(&self.pool)
        .await?;

        let value: i64 = row.try_get("value")?;
        Ok(value.max(0) as u64)
    }

    async fn read(&self, key: &str, now: Timestamp) -> StoreResult<Option<StoredState>> {
        let row = sqlx::query(
            "SELECT state, version FROM gatekeeper_counters WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(now.as_secs())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let state: String = row.try_get("state")?;
                let version: i64 = row.try_get("version")?;
                Ok(Some(StoredState {
                    state: serde_json::from_str(&state)?,
                    version: version as u64,
                }))
            }
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        key: &str,
        state: &CounterState,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO gatekeeper_counters (key, state, version, expires_at) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 state = excluded.state,
                 version = gatekeeper_counters.version + 1,
                 expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(payload)
        .bind((now + ttl).as_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let payload = serde_json::to_string(state)?;
        let expires_at = (now + ttl).as_secs();

        // Versions keep increasing across expiry, so a stale reader can never
        // match a row that was recreated underneath it.
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO gatekeeper_counters (key, state, version, expires_at)
                     VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                         state = excluded.state,
                         version = gatekeeper_counters.version + 1,
                         expires_at = excluded.expires_at
                     WHERE gatekeeper_counters.expires_at <= ?4",
                )
                .bind(key)
                .bind(payload)
                .bind(expires_at)
                .bind(now.as_secs())
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    "UPDATE gatekeeper_counters
                     SET state = ?1, version = version + 1, expires_at = ?2
                     WHERE key = ?3 AND version = ?4 AND expires_at > ?5",
                )
                .bind(payload)
                .bind(expires_at)
                .bind(key)
                .bind(version as i64)
                .bind(now.as_secs())
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
        f: &mut StateUpdate<'_>,
    ) -> StoreResult<CounterState> {
        let mut tx = self.pool.begin().await?;

        // A write statement first, so the transaction holds the write lock
        // before it reads.
        sqlx::query("UPDATE gatekeeper_counters SET version = version WHERE key = ?1")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            "SELECT state FROM gatekeeper_counters WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(now.as_secs())
        .fetch_optional(&mut *tx)
        .await?;

        let current: Option<CounterState> = match row {
            Some(row) => {
                let state: String = row.try_get("state")?;
                Some(serde_json::from_str(&state)?)
            }
            None => None,
        };

        let next = f(current.as_ref());
        let payload = serde_json::to_string(&next)?;
        sqlx::query(
            "INSERT INTO gatekeeper_counters (key, state, version, expires_at) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 state = excluded.state,
                 version = gatekeeper_counters.version + 1,
                 expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(payload)
        .bind((now + ttl).as_secs())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next)
    }

    async fn list_add(&self, list: ListKind, entry: ListEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO gatekeeper_list_entries (list, identifier, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(list, identifier) DO UPDATE SET
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
        )
        .bind(list.as_str())
        .bind(&entry.identifier)
        .bind(entry.created_at.as_secs())
        .bind(entry.expires_at.map(|t| t.as_secs()))
        .execute(&self.pool)
        .await?;

        debug!(list = %list, identifier = %entry.identifier, "Added list entry");
        Ok(())
    }

    async fn list_remove(&self, list: ListKind, identifier: &str) -> StoreResult<bool> {
        let result =
            sqlx::query("DELETE FROM gatekeeper_list_entries WHERE list = ?1 AND identifier = ?2")
                .bind(list.as_str())
                .bind(identifier)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_contains(
        &self,
        list: ListKind,
        identifier: &str,
        now: Timestamp,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM gatekeeper_list_entries
             WHERE list = ?1 AND identifier = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
        )
        .bind(list.as_str())
        .bind(identifier)
        .bind(now.as_secs())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn list_entries(&self, list: ListKind, now: Timestamp) -> StoreResult<Vec<ListEntry>> {
        let rows = sqlx::query(
            "SELECT identifier, created_at, expires_at FROM gatekeeper_list_entries
             WHERE list = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY identifier",
        )
        .bind(list.as_str())
        .bind(now.as_secs())
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: f64 = row.try_get("created_at")?;
            let expires_at: Option<f64> = row.try_get("expires_at")?;
            entries.push(ListEntry {
                identifier: row.try_get("identifier")?,
                created_at: Timestamp::from_secs(created_at),
                expires_at: expires_at.map(Timestamp::from_secs),
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlStore {
        SqlStore::connect("sqlite::memory:", 4).await.unwrap()
    }

    fn t(secs: f64) -> Timestamp {
        Timestamp::from_secs(1_700_000_000.0 + secs)
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let store = memory_store().await;
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment_and_get("strikes", 1, ttl, t(0.0)).await.unwrap(), 1);
        assert_eq!(store.increment_and_get("strikes", 1, ttl, t(30.0)).await.unwrap(), 2);
        // TTL is anchored at the first hit.
        assert_eq!(store.increment_and_get("strikes", 1, ttl, t(60.0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_versions() {
        let store = memory_store().await;
        let ttl = Duration::from_secs(10);
        let first = CounterState::FixedWindow { count: 1, window_start: t(0.0) };
        let second = CounterState::FixedWindow { count: 2, window_start: t(0.0) };

        assert!(store.compare_and_swap("fw", None, &first, ttl, t(0.0)).await.unwrap());
        assert!(!store.compare_and_swap("fw", None, &first, ttl, t(1.0)).await.unwrap());

        let stored = store.read("fw", t(1.0)).await.unwrap().unwrap();
        assert_eq!(stored.state, first);

        assert!(store
            .compare_and_swap("fw", Some(stored.version), &second, ttl, t(1.0))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("fw", Some(stored.version), &second, ttl, t(1.0))
            .await
            .unwrap());

        // Once expired, the key counts as absent again.
        assert!(store.read("fw", t(20.0)).await.unwrap().is_none());
        assert!(store.compare_and_swap("fw", None, &first, ttl, t(20.0)).await.unwrap());
        let recreated = store.read("fw", t(20.0)).await.unwrap().unwrap();
        assert!(recreated.version > stored.version);
    }

    #[tokio::test]
    async fn test_update_applies_in_order() {
        let store = memory_store().await;
        let ttl = Duration::from_secs(60);

        for expected in 1..=3u64 {
            let mut f = |current: Option<&CounterState>| {
                let count = match current {
                    Some(CounterState::FixedWindow { count, .. }) => *count,
                    _ => 0,
                };
                CounterState::FixedWindow { count: count + 1, window_start: t(0.0) }
            };
            let state = store.update("fw", ttl, t(1.0), &mut f).await.unwrap();
            assert_eq!(state, CounterState::FixedWindow { count: expected, window_start: t(0.0) });
        }
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let store = std::sync::Arc::new(memory_store().await);
        let ttl = Duration::from_secs(60);

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut bump = |current: Option<&CounterState>| {
                        let count = match current {
                            Some(CounterState::FixedWindow { count, .. }) => *count,
                            _ => 0,
                        };
                        CounterState::FixedWindow { count: count + 1, window_start: t(0.0) }
                    };
                    store.update("fw", ttl, t(1.0), &mut bump).await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.read("fw", t(1.0)).await.unwrap().unwrap();
        assert_eq!(stored.state, CounterState::FixedWindow { count: 50, window_start: t(0.0) });
        assert_eq!(stored.version, 50);
    }

    #[tokio::test]
    async fn test_lists_and_purge() {
        let store = memory_store().await;

        store
            .list_add(ListKind::Blacklist, ListEntry::new("203.0.113.9", t(0.0), Some(Duration::from_secs(3600))))
            .await
            .unwrap();
        store
            .list_add(ListKind::Blacklist, ListEntry::new("198.51.100.1", t(0.0), None))
            .await
            .unwrap();

        assert!(store.list_contains(ListKind::Blacklist, "203.0.113.9", t(3599.0)).await.unwrap());
        assert!(!store.list_contains(ListKind::Blacklist, "203.0.113.9", t(3601.0)).await.unwrap());
        assert!(!store.list_contains(ListKind::Whitelist, "198.51.100.1", t(0.0)).await.unwrap());

        let entries = store.list_entries(ListKind::Blacklist, t(10.0)).await.unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["198.51.100.1", "203.0.113.9"]);

        assert_eq!(store.purge_expired(t(4000.0)).await.unwrap(), 1);
        assert!(store.list_remove(ListKind::Blacklist, "198.51.100.1").await.unwrap());
        assert!(!store.list_remove(ListKind::Blacklist, "198.51.100.1").await.unwrap());
    }
}
