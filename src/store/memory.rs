//! In-process counter store for single-instance deployments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    CounterState, CounterStore, ListEntry, ListKind, StateUpdate, StoreResult, StoredState,
};
use crate::time::Timestamp;

/// Default period of the background sweep started by [`open`](super::open).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A versioned state slot.
#[derive(Debug)]
struct Slot {
    state: Option<CounterState>,
    version: u64,
    expires_at: Timestamp,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            state: None,
            version: 0,
            expires_at: Timestamp::default(),
        }
    }

    fn is_live(&self, now: Timestamp) -> bool {
        self.state.is_some() && now < self.expires_at
    }

    fn live_state(&self, now: Timestamp) -> Option<&CounterState> {
        if self.is_live(now) {
            self.state.as_ref()
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct Tally {
    value: u64,
    expires_at: Timestamp,
}

/// Counter store backed by sharded concurrent maps.
///
/// Per-key atomicity comes from the map's shard locks: every mutation of a
/// key happens while holding its entry, so concurrent callers hitting the
/// same key are serialized. [`CounterStore::update`] runs the transition
/// closure under that lock instead of looping on compare-and-swap.
///
/// Expired entries are ignored by every read. They are removed by
/// [`sweep_expired`](Self::sweep_expired), which
/// [`spawn_sweeper`](Self::spawn_sweeper) runs off the request path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: DashMap<String, Slot>,
    tallies: DashMap<String, Tally>,
    lists: DashMap<(ListKind, String), ListEntry>,
    /// Source of store-wide unique versions
    versions: AtomicU64,
    /// Bits of the latest `now` passed to a mutation
    latest: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of state slots currently held (live or awaiting sweep).
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Drop every expired state, counter and list entry.
    pub fn sweep_expired(&self, now: Timestamp) {
        let before = self.states.len() + self.tallies.len() + self.lists.len();
        self.states.retain(|_, slot| slot.is_live(now));
        self.tallies.retain(|_, tally| now < tally.expires_at);
        self.lists.retain(|_, entry| entry.is_live(now));
        let after = self.states.len() + self.tallies.len() + self.lists.len();

        if before != after {
            debug!(removed = before - after, "Swept expired entries from memory store");
        }
    }

    /// The latest time any mutation was evaluated at.
    pub fn latest_seen(&self) -> Timestamp {
        Timestamp::from_secs(f64::from_bits(self.latest.load(Ordering::Relaxed)))
    }

    /// Sweep every `every` on a background task, judging expiry by
    /// [`latest_seen`](Self::latest_seen). The task ends once the store is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep_expired(store.latest_seen());
            }
            trace!("Memory store dropped, sweeper stopped");
        })
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Non-negative floats order the same as their bit patterns.
    fn observe(&self, now: Timestamp) {
        self.latest
            .fetch_max(now.as_secs().max(0.0).to_bits(), Ordering::Relaxed);
    }

    fn increment_sync(&self, key: &str, amount: u64, ttl: Duration, now: Timestamp) -> u64 {
        self.observe(now);

        let mut tally = self.tallies.entry(key.to_string()).or_insert_with(|| Tally {
            value: 0,
            expires_at: now + ttl,
        });
        if now >= tally.expires_at {
            tally.value = 0;
            tally.expires_at = now + ttl;
        }
        tally.value = tally.value.saturating_add(amount);
        tally.value
    }

    fn read_sync(&self, key: &str, now: Timestamp) -> Option<StoredState> {
        let slot = self.states.get(key)?;
        slot.live_state(now).map(|state| StoredState {
            state: state.clone(),
            version: slot.version,
        })
    }

    fn write_sync(&self, key: &str, state: &CounterState, ttl: Duration, now: Timestamp) {
        self.observe(now);

        let version = self.next_version();
        let mut slot = self.states.entry(key.to_string()).or_insert_with(Slot::vacant);
        slot.state = Some(state.clone());
        slot.version = version;
        slot.expires_at = now + ttl;
    }

    fn compare_and_swap_sync(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
        now: Timestamp,
    ) -> bool {
        self.observe(now);

        let version = self.next_version();
        let mut slot = self.states.entry(key.to_string()).or_insert_with(Slot::vacant);
        let matches = match expected {
            Some(expected) => slot.is_live(now) && slot.version == expected,
            None => !slot.is_live(now),
        };
        if !matches {
            return false;
        }

        slot.state = Some(state.clone());
        slot.version = version;
        slot.expires_at = now + ttl;
        true
    }

    fn update_sync(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
        f: &mut StateUpdate<'_>,
    ) -> CounterState {
        self.observe(now);

        let version = self.next_version();
        let mut slot = self.states.entry(key.to_string()).or_insert_with(Slot::vacant);
        let next = f(slot.live_state(now));
        slot.state = Some(next.clone());
        slot.version = version;
        slot.expires_at = now + ttl;

        trace!(key = %key, version = version, "Updated state in memory store");
        next
    }

    fn list_contains_sync(&self, list: ListKind, identifier: &str, now: Timestamp) -> bool {
        self.lists
            .get(&(list, identifier.to_string()))
            .map(|entry| entry.is_live(now))
            .unwrap_or(false)
    }

    fn list_entries_sync(&self, list: ListKind, now: Timestamp) -> Vec<ListEntry> {
        let mut entries: Vec<ListEntry> = self
            .lists
            .iter()
            .filter(|item| item.key().0 == list && item.value().is_live(now))
            .map(|item| item.value().clone())
            .collect();
        entries.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        entries
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn increment_and_get(
        &self,
        key: &str,
        amount: u64,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<u64> {
        Ok(self.increment_sync(key, amount, ttl, now))
    }

    async fn read(&self, key: &str, now: Timestamp) -> StoreResult<Option<StoredState>> {
        Ok(self.read_sync(key, now))
    }

    async fn write(
        &self,
        key: &str,
        state: &CounterState,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<()> {
        self.write_sync(key, state, ttl, now);
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
        Ok(self.compare_and_swap_sync(key, expected, state, ttl, now))
    }

    async fn update(
        &self,
        key: &str,
        ttl: Duration,
        now: Timestamp,
        f: &mut StateUpdate<'_>,
    ) -> StoreResult<CounterState> {
        Ok(self.update_sync(key, ttl, now, f))
    }

    async fn list_add(&self, list: ListKind, entry: ListEntry) -> StoreResult<()> {
        self.lists.insert((list, entry.identifier.clone()), entry);
        Ok(())
    }

    async fn list_remove(&self, list: ListKind, identifier: &str) -> StoreResult<bool> {
        Ok(self.lists.remove(&(list, identifier.to_string())).is_some())
    }

    async fn list_contains(
        &self,
        list: ListKind,
        identifier: &str,
        now: Timestamp,
    ) -> StoreResult<bool> {
        Ok(self.list_contains_sync(list, identifier, now))
    }

    async fn list_entries(&self, list: ListKind, now: Timestamp) -> StoreResult<Vec<ListEntry>> {
        Ok(self.list_entries_sync(list, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: f64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[tokio::test]
    async fn test_increment_and_get() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment_and_get("k", 1, ttl, t(0.0)).await.unwrap(), 1);
        assert_eq!(store.increment_and_get("k", 4, ttl, t(1.0)).await.unwrap(), 5);
        assert_eq!(store.increment_and_get("other", 1, ttl, t(1.0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_restarts_after_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        store.increment_and_get("k", 7, ttl, t(0.0)).await.unwrap();
        assert_eq!(store.increment_and_get("k", 1, ttl, t(9.9)).await.unwrap(), 8);
        assert_eq!(store.increment_and_get("k", 1, ttl, t(10.0)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_write_and_expiry() {
        let store = MemoryStore::new();
        let state = CounterState::Hold { until: t(100.0) };

        assert!(store.read("k", t(0.0)).await.unwrap().is_none());

        store.write("k", &state, Duration::from_secs(5), t(0.0)).await.unwrap();
        let stored = store.read("k", t(4.0)).await.unwrap().unwrap();
        assert_eq!(stored.state, state);

        assert!(store.read("k", t(5.0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        let first = CounterState::FixedWindow { count: 1, window_start: t(0.0) };
        let second = CounterState::FixedWindow { count: 2, window_start: t(0.0) };

        assert!(store.compare_and_swap("k", None, &first, ttl, t(0.0)).await.unwrap());
        // Creating again must fail: a live state exists.
        assert!(!store.compare_and_swap("k", None, &first, ttl, t(0.0)).await.unwrap());

        let stored = store.read("k", t(0.0)).await.unwrap().unwrap();
        assert!(!store
            .compare_and_swap("k", Some(stored.version + 100), &second, ttl, t(0.0))
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(stored.version), &second, ttl, t(0.0))
            .await
            .unwrap());
        assert_eq!(store.read("k", t(0.0)).await.unwrap().unwrap().state, second);
    }

    #[tokio::test]
    async fn test_update_sees_only_live_state() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        let bump = |current: Option<&CounterState>| match current {
            Some(CounterState::FixedWindow { count, window_start }) => CounterState::FixedWindow {
                count: count + 1,
                window_start: *window_start,
            },
            _ => CounterState::FixedWindow { count: 1, window_start: t(0.0) },
        };

        let mut f = bump;
        store.update("k", ttl, t(0.0), &mut f).await.unwrap();
        let next = store.update("k", ttl, t(1.0), &mut f).await.unwrap();
        assert_eq!(next, CounterState::FixedWindow { count: 2, window_start: t(0.0) });

        // After the TTL lapses the closure sees no state again.
        let next = store.update("k", ttl, t(20.0), &mut f).await.unwrap();
        assert_eq!(next, CounterState::FixedWindow { count: 1, window_start: t(0.0) });
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_linearizable() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    let mut f = |current: Option<&CounterState>| match current {
                        Some(CounterState::FixedWindow { count, window_start }) => {
                            CounterState::FixedWindow {
                                count: count + 1,
                                window_start: *window_start,
                            }
                        }
                        _ => CounterState::FixedWindow { count: 1, window_start: t(0.0) },
                    };
                    store
                        .update("shared", Duration::from_secs(60), t(0.0), &mut f)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.read("shared", t(0.0)).await.unwrap().unwrap();
        assert_eq!(stored.state, CounterState::FixedWindow { count: 2000, window_start: t(0.0) });
    }

    #[tokio::test]
    async fn test_lists_with_lazy_expiry() {
        let store = MemoryStore::new();
        let now = t(1_000.0);

        store
            .list_add(ListKind::Blacklist, ListEntry::new("1.2.3.4", now, Some(Duration::from_secs(60))))
            .await
            .unwrap();
        store
            .list_add(ListKind::Whitelist, ListEntry::new("1.2.3.4", now, None))
            .await
            .unwrap();

        assert!(store.list_contains(ListKind::Blacklist, "1.2.3.4", now).await.unwrap());
        assert!(!store.list_contains(ListKind::Blacklist, "1.2.3.4", now + 60.0).await.unwrap());
        assert!(store.list_contains(ListKind::Whitelist, "1.2.3.4", now + 60.0).await.unwrap());

        assert_eq!(store.list_entries(ListKind::Blacklist, now).await.unwrap().len(), 1);
        assert!(store.list_entries(ListKind::Blacklist, now + 61.0).await.unwrap().is_empty());

        assert!(store.list_remove(ListKind::Whitelist, "1.2.3.4").await.unwrap());
        assert!(!store.list_remove(ListKind::Whitelist, "1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let store = MemoryStore::new();
        let state = CounterState::Hold { until: t(1.0) };

        store.write("a", &state, Duration::from_secs(1), t(0.0)).await.unwrap();
        store.write("b", &state, Duration::from_secs(100), t(0.0)).await.unwrap();
        assert_eq!(store.state_count(), 2);

        store.sweep_expired(t(50.0));
        assert_eq!(store.state_count(), 1);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let store = Arc::new(MemoryStore::new());
        let state = CounterState::Hold { until: t(1.0) };

        store.write("short", &state, Duration::from_secs(1), t(0.0)).await.unwrap();
        store.write("long", &state, Duration::from_secs(100), t(0.0)).await.unwrap();
        // Later traffic moves the store's clock past the short entry.
        store.increment_and_get("hits", 1, Duration::from_secs(100), t(50.0)).await.unwrap();
        assert_eq!(store.latest_seen(), t(50.0));
        assert_eq!(store.state_count(), 2);

        let sweeper = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.state_count(), 1);
        assert!(store.read("long", t(50.0)).await.unwrap().is_some());

        drop(store);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sweeper.is_finished());
    }
}
