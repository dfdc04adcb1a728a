//! Store wrappers for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{CounterState, CounterStore, ListEntry, ListKind, MemoryStore, StoreResult, StoredState};
use crate::time::Timestamp;

/// In-process store that answers like a remote one: every `read` takes
/// `lag`, and `update` is the trait's compare-and-swap loop.
pub(crate) struct LaggyStore {
    inner: MemoryStore,
    lag: Duration,
    reads: AtomicU64,
}

impl LaggyStore {
    pub(crate) fn new(lag: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            lag,
            reads: AtomicU64::new(0),
        }
    }

    pub(crate) fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CounterStore for LaggyStore {
    fn backend(&self) -> &'static str {
        "laggy"
    }

    async fn increment_and_get(&self, key: &str, amount: u64, ttl: Duration, now: Timestamp) -> StoreResult<u64> {
        self.inner.increment_and_get(key, amount, ttl, now).await
    }

    async fn read(&self, key: &str, now: Timestamp) -> StoreResult<Option<StoredState>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let stored = self.inner.read(key, now).await;
        tokio::time::sleep(self.lag).await;
        stored
    }

    async fn write(&self, key: &str, state: &CounterState, ttl: Duration, now: Timestamp) -> StoreResult<()> {
        self.inner.write(key, state, ttl, now).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        state: &CounterState,
        ttl: Duration,
        now: Timestamp,
    ) -> StoreResult<bool> {
        self.inner.compare_and_swap(key, expected, state, ttl, now).await
    }

    async fn list_add(&self, list: ListKind, entry: ListEntry) -> StoreResult<()> {
        self.inner.list_add(list, entry).await
    }

    async fn list_remove(&self, list: ListKind, identifier: &str) -> StoreResult<bool> {
        self.inner.list_remove(list, identifier).await
    }

    async fn list_contains(&self, list: ListKind, identifier: &str, now: Timestamp) -> StoreResult<bool> {
        self.inner.list_contains(list, identifier, now).await
    }

    async fn list_entries(&self, list: ListKind, now: Timestamp) -> StoreResult<Vec<ListEntry>> {
        self.inner.list_entries(list, now).await
    }
}
