//! Admission counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Counters for admission outcomes.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct AdmissionMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    allowed: AtomicU64,
    denied: AtomicU64,
    challenged: AtomicU64,
    whitelisted: AtomicU64,
    blacklisted: AtomicU64,
    rate_limited: AtomicU64,
    bot_denied: AtomicU64,
    /// Stages skipped because the store failed or timed out
    fail_open: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.inner.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_challenged(&self) {
        self.inner.challenged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_whitelisted(&self) {
        self.inner.whitelisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blacklisted(&self) {
        self.inner.blacklisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.inner.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bot_denied(&self) {
        self.inner.bot_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fail_open(&self) {
        self.inner.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of stages that failed open.
    pub fn fail_open(&self) -> u64 {
        self.inner.fail_open.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;

        MetricsSnapshot {
            allowed: load(&inner.allowed),
            denied: load(&inner.denied),
            challenged: load(&inner.challenged),
            whitelisted: load(&inner.whitelisted),
            blacklisted: load(&inner.blacklisted),
            rate_limited: load(&inner.rate_limited),
            bot_denied: load(&inner.bot_denied),
            fail_open: load(&inner.fail_open),
        }
    }
}

/// A point-in-time copy of [`AdmissionMetrics`].
///
/// `whitelisted` is a subset of `allowed`; `blacklisted`, `rate_limited`
/// and `bot_denied` are subsets of `denied`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub challenged: u64,
    pub whitelisted: u64,
    pub blacklisted: u64,
    pub rate_limited: u64,
    pub bot_denied: u64,
    pub fail_open: u64,
}

impl MetricsSnapshot {
    /// Total number of decisions made.
    pub fn total(&self) -> u64 {
        self.allowed
            .saturating_add(self.denied)
            .saturating_add(self.challenged)
    }

    /// Share of decisions that were not an allow (0.0 to 1.0).
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.denied + self.challenged) as f64 / total as f64
        }
    }
}
