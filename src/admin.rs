//! Administrative operations: policy management, allow/deny lists and
//! per-caller statistics.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::admission::Pipeline;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{EndpointPolicy, Policy, PolicySet, PolicyStore, ScopeKey, ScopePolicy, ScopeType};
use crate::store::{CounterState, CounterStore, ListEntry, ListKind};
use crate::time::Timestamp;

/// What the administration knows about one caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallerStats {
    pub scope: ScopeType,
    pub identifier: String,
    pub rate_limit_key: ScopeKey,
    pub whitelisted: bool,
    pub blacklisted: bool,
    /// Live counter state under `rate_limit_key`, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<CounterState>,
    /// End of an active violator block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<Timestamp>,
}

/// Handle for changing what the pipeline enforces.
///
/// Policy changes take effect for the next request; list changes are
/// visible to every instance sharing the store.
#[derive(Clone)]
pub struct Administration {
    policies: Arc<PolicyStore>,
    store: Arc<dyn CounterStore>,
}

impl Administration {
    pub fn new(policies: Arc<PolicyStore>, store: Arc<dyn CounterStore>) -> Self {
        Self { policies, store }
    }

    /// Administration for the policies and store used by `pipeline`.
    pub fn for_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.policies().clone(), pipeline.store().clone())
    }

    /// The policy set currently enforced.
    pub fn policies(&self) -> Arc<PolicySet> {
        self.policies.snapshot()
    }

    /// Replace the whole policy set. Malformed sets are rejected.
    pub fn replace_policies(&self, set: PolicySet) -> Result<()> {
        let problems = set.validate();
        if !problems.is_empty() {
            return Err(GatekeeperError::Config(problems.join("; ")));
        }
        self.policies.replace(set);
        Ok(())
    }

    /// Add or replace the policy for an endpoint path.
    pub fn upsert_endpoint(&self, path: &str, policy: Policy) -> Result<()> {
        if path.is_empty() {
            return Err(GatekeeperError::Config("endpoint path must not be empty".to_string()));
        }
        policy.validate()?;

        self.policies.modify(|set| {
            match set.endpoints.iter_mut().find(|entry| entry.path == path) {
                Some(entry) => entry.policy = policy,
                None => set.endpoints.push(EndpointPolicy::new(path, policy)),
            }
        });
        info!(endpoint = %path, "Endpoint policy updated");
        Ok(())
    }

    /// Remove an endpoint policy; returns whether it existed.
    pub fn remove_endpoint(&self, path: &str) -> bool {
        let mut removed = false;
        self.policies.modify(|set| {
            let before = set.endpoints.len();
            set.endpoints.retain(|entry| entry.path != path);
            removed = set.endpoints.len() != before;
        });
        if removed {
            info!(endpoint = %path, "Endpoint policy removed");
        }
        removed
    }

    /// Set the default policy for requests counted under `scope`.
    pub fn set_scope_default(&self, scope: ScopeType, policy: Policy) -> Result<()> {
        policy.validate()?;

        self.policies.modify(|set| {
            match set.scopes.iter_mut().find(|entry| entry.applies_to == scope) {
                Some(entry) => entry.policy = policy,
                None => set.scopes.push(ScopePolicy {
                    applies_to: scope,
                    policy,
                }),
            }
        });
        info!(scope = %scope, "Scope default policy updated");
        Ok(())
    }

    /// Drop the default policy for `scope`; returns whether it existed.
    pub fn clear_scope_default(&self, scope: ScopeType) -> bool {
        let mut removed = false;
        self.policies.modify(|set| {
            let before = set.scopes.len();
            set.scopes.retain(|entry| entry.applies_to != scope);
            removed = set.scopes.len() != before;
        });
        removed
    }

    pub fn set_global(&self, policy: Policy) -> Result<()> {
        policy.validate()?;
        self.policies.modify(|set| set.global = policy);
        info!("Global policy updated");
        Ok(())
    }

    /// Put an identifier (IP or user id) on a list, optionally expiring
    /// after `expire`.
    pub async fn list_add(
        &self,
        list: ListKind,
        identifier: &str,
        expire: Option<Duration>,
        now: Timestamp,
    ) -> Result<ListEntry> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(GatekeeperError::Config("list identifier must not be empty".to_string()));
        }
        if expire == Some(Duration::ZERO) {
            return Err(GatekeeperError::Config("list expiry must be positive".to_string()));
        }

        let entry = ListEntry::new(identifier, now, expire);
        self.store.list_add(list, entry.clone()).await?;

        info!(list = %list, identifier = %identifier, expire = ?expire, "Added list entry");
        Ok(entry)
    }

    /// Take an identifier off a list; returns whether it was listed.
    pub async fn list_remove(&self, list: ListKind, identifier: &str) -> Result<bool> {
        let removed = self.store.list_remove(list, identifier.trim()).await?;
        if removed {
            info!(list = %list, identifier = %identifier, "Removed list entry");
        }
        Ok(removed)
    }

    /// Live entries on a list.
    pub async fn list(&self, list: ListKind, now: Timestamp) -> Result<Vec<ListEntry>> {
        Ok(self.store.list_entries(list, now).await?)
    }

    /// Rate limit key, list membership and counter state for one caller.
    pub async fn stats(
        &self,
        scope: ScopeType,
        identifier: &str,
        endpoint: Option<&str>,
        user_id: Option<&str>,
        now: Timestamp,
    ) -> Result<CallerStats> {
        let rate_limit_key = ScopeKey::resolve(scope, identifier, user_id, endpoint.unwrap_or_default());

        let whitelisted = self.store.list_contains(ListKind::Whitelist, identifier, now).await?;
        let blacklisted = self.store.list_contains(ListKind::Blacklist, identifier, now).await?;
        let counter = self
            .store
            .read(rate_limit_key.as_str(), now)
            .await?
            .map(|stored| stored.state);
        let blocked_until = match self.store.read(&rate_limit_key.block_key(), now).await? {
            Some(stored) => match stored.state {
                CounterState::Hold { until } if now < until => Some(until),
                _ => None,
            },
            None => None,
        };

        Ok(CallerStats {
            scope,
            identifier: identifier.to_string(),
            rate_limit_key,
            whitelisted,
            blacklisted,
            counter,
            blocked_until,
        })
    }
}

impl std::fmt::Debug for Administration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Administration")
            .field("store", &self.store.backend())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::PolicySource;
    use crate::store::MemoryStore;
    use tokio_test::{assert_err, assert_ok};

    fn now() -> Timestamp {
        Timestamp::from_secs(1_700_000_000.0)
    }

    fn admin() -> Administration {
        Administration::new(
            Arc::new(PolicyStore::default()),
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn test_upsert_and_remove_endpoint() {
        let admin = admin();
        let before = admin.policies().endpoints.len();

        admin
            .upsert_endpoint("/reports", Policy::sliding_window(30, 60))
            .unwrap();
        admin
            .upsert_endpoint("/reports", Policy::sliding_window(40, 60))
            .unwrap();

        let set = admin.policies();
        assert_eq!(set.endpoints.len(), before + 1);
        let resolved = set.resolve("/reports/daily", ScopeType::Ip);
        assert_eq!(resolved.source, PolicySource::Endpoint("/reports".to_string()));
        assert_eq!(resolved.policy.capacity, 40);

        assert!(admin.remove_endpoint("/reports"));
        assert!(!admin.remove_endpoint("/reports"));
        assert_eq!(admin.policies().endpoints.len(), before);
    }

    #[test]
    fn test_malformed_policies_are_rejected() {
        let admin = admin();

        assert_err!(admin.upsert_endpoint("/x", Policy::fixed_window(0, 60)));
        assert_err!(admin.upsert_endpoint("", Policy::fixed_window(5, 60)));
        assert_err!(admin.set_global(Policy::fixed_window(10, 0)));
        assert_err!(admin.set_scope_default(
            ScopeType::User,
            Policy::token_bucket(5, 60).with_refill_rate(0.0)
        ));

        let bad = PolicySet::with_global(Policy::fixed_window(0, 60));
        assert_err!(admin.replace_policies(bad));
        assert_eq!(admin.policies().global, Policy::default());
    }

    #[test]
    fn test_scope_default() {
        let admin = admin();
        assert_ok!(admin.set_scope_default(ScopeType::User, Policy::fixed_window(500, 3600)));

        let resolved = admin.policies().resolve("/users", ScopeType::User);
        assert_eq!(resolved.source, PolicySource::Scope(ScopeType::User));
        assert_eq!(resolved.policy.capacity, 500);

        assert!(admin.clear_scope_default(ScopeType::User));
        let resolved = admin.policies().resolve("/users", ScopeType::User);
        assert_eq!(resolved.source, PolicySource::Global);
    }

    #[tokio::test]
    async fn test_list_management() {
        let admin = admin();

        admin
            .list_add(ListKind::Blacklist, "198.51.100.7", Some(Duration::from_secs(3600)), now())
            .await
            .unwrap();
        admin
            .list_add(ListKind::Blacklist, "42", None, now())
            .await
            .unwrap();
        assert!(admin.list_add(ListKind::Whitelist, "  ", None, now()).await.is_err());

        let entries = admin.list(ListKind::Blacklist, now()).await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["198.51.100.7", "42"]);

        // The expiring entry drops out of the listing.
        let later = admin.list(ListKind::Blacklist, now() + 3601.0).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].identifier, "42");

        assert!(admin.list_remove(ListKind::Blacklist, "42").await.unwrap());
        assert!(!admin.list_remove(ListKind::Blacklist, "42").await.unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        let admin = Administration::new(Arc::new(PolicyStore::default()), store.clone());

        admin
            .list_add(ListKind::Whitelist, "203.0.113.4", None, now())
            .await
            .unwrap();

        let stats = admin
            .stats(ScopeType::IpEndpoint, "203.0.113.4", Some("/auth/login"), None, now())
            .await
            .unwrap();
        assert_eq!(stats.rate_limit_key.as_str(), "ip_endpoint:203.0.113.4|/auth/login");
        assert!(stats.whitelisted);
        assert!(!stats.blacklisted);
        assert_eq!(stats.counter, None);
        assert_eq!(stats.blocked_until, None);

        let hold = CounterState::Hold { until: now() + 60.0 };
        store
            .write("block:ip:203.0.113.4", &hold, Duration::from_secs(60), now())
            .await
            .unwrap();
        let stats = admin
            .stats(ScopeType::Ip, "203.0.113.4", None, None, now())
            .await
            .unwrap();
        assert_eq!(stats.blocked_until, Some(now() + 60.0));
    }
}
