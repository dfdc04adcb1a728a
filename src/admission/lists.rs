//! Whitelist and blacklist checks.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::ListsConfig;
use crate::store::{CounterStore, ListKind, StoreResult};
use crate::time::Timestamp;

/// Outcome of a list check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListStatus {
    /// Neither the IP nor the user is listed
    Unlisted,
    Whitelisted { identifier: String },
    Blacklisted { identifier: String },
}

/// Consults the administrative lists kept in the counter store.
pub struct ListGuard {
    config: ListsConfig,
    store: Arc<dyn CounterStore>,
}

impl ListGuard {
    pub fn new(config: ListsConfig, store: Arc<dyn CounterStore>) -> Self {
        Self { config, store }
    }

    /// Whether list checks are skipped for `path`.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.config
            .exclude_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Check the caller IP and, when present, the user id.
    ///
    /// The blacklist is consulted first, so an identifier on both lists is
    /// blacklisted.
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        ip: &str,
        user_id: Option<&str>,
        now: Timestamp,
    ) -> StoreResult<ListStatus> {
        let identifiers: Vec<&str> = std::iter::once(ip)
            .chain(user_id)
            .filter(|id| !id.is_empty())
            .collect();

        if self.config.enable_blacklist {
            if let Some(identifier) = self.first_listed(ListKind::Blacklist, &identifiers, now).await? {
                debug!(identifier = %identifier, "Caller is blacklisted");
                return Ok(ListStatus::Blacklisted { identifier });
            }
        }

        if self.config.enable_whitelist {
            if let Some(identifier) = self.first_listed(ListKind::Whitelist, &identifiers, now).await? {
                debug!(identifier = %identifier, "Caller is whitelisted");
                return Ok(ListStatus::Whitelisted { identifier });
            }
        }

        Ok(ListStatus::Unlisted)
    }

    async fn first_listed(
        &self,
        list: ListKind,
        identifiers: &[&str],
        now: Timestamp,
    ) -> StoreResult<Option<String>> {
        for identifier in identifiers {
            if self.store.list_contains(list, identifier, now).await? {
                return Ok(Some(identifier.to_string()));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for ListGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListGuard")
            .field("config", &self.config)
            .field("store", &self.store.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ListEntry, MemoryStore};
    use std::time::Duration;

    fn now() -> Timestamp {
        Timestamp::from_secs(1_700_000_000.0)
    }

    async fn guard_with(entries: &[(ListKind, &str, Option<u64>)]) -> ListGuard {
        let store = Arc::new(MemoryStore::new());
        for (list, identifier, ttl) in entries {
            store
                .list_add(*list, ListEntry::new(*identifier, now(), ttl.map(Duration::from_secs)))
                .await
                .unwrap();
        }
        ListGuard::new(ListsConfig::default(), store)
    }

    #[tokio::test]
    async fn test_unlisted_caller() {
        let guard = guard_with(&[]).await;
        let status = guard.check("203.0.113.4", Some("42"), now()).await.unwrap();
        assert_eq!(status, ListStatus::Unlisted);
    }

    #[tokio::test]
    async fn test_blacklist_wins_over_whitelist() {
        let guard = guard_with(&[
            (ListKind::Whitelist, "203.0.113.4", None),
            (ListKind::Blacklist, "203.0.113.4", None),
        ])
        .await;

        let status = guard.check("203.0.113.4", None, now()).await.unwrap();
        assert_eq!(
            status,
            ListStatus::Blacklisted {
                identifier: "203.0.113.4".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_user_id_is_checked() {
        let guard = guard_with(&[(ListKind::Whitelist, "42", None)]).await;

        let status = guard.check("198.51.100.9", Some("42"), now()).await.unwrap();
        assert_eq!(
            status,
            ListStatus::Whitelisted {
                identifier: "42".to_string()
            }
        );

        let status = guard.check("198.51.100.9", None, now()).await.unwrap();
        assert_eq!(status, ListStatus::Unlisted);
    }

    #[tokio::test]
    async fn test_expired_entry_is_ignored() {
        let guard = guard_with(&[(ListKind::Blacklist, "203.0.113.4", Some(3600))]).await;

        assert!(matches!(
            guard.check("203.0.113.4", None, now() + 3599.0).await.unwrap(),
            ListStatus::Blacklisted { .. }
        ));
        assert_eq!(
            guard.check("203.0.113.4", None, now() + 3601.0).await.unwrap(),
            ListStatus::Unlisted
        );
    }

    #[tokio::test]
    async fn test_disabled_lists_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        store
            .list_add(ListKind::Blacklist, ListEntry::new("203.0.113.4", now(), None))
            .await
            .unwrap();
        let guard = ListGuard::new(
            ListsConfig {
                enable_blacklist: false,
                ..ListsConfig::default()
            },
            store,
        );

        let status = guard.check("203.0.113.4", None, now()).await.unwrap();
        assert_eq!(status, ListStatus::Unlisted);
    }
}
