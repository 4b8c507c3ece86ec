//! Scope regulation: which scopes are answerable to remote queries at all.

use crate::policy::{Decision, PolicyEvaluator};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// What a remote query may learn about a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeFacet {
    Count,
    Ids,
    Traverse,
}

impl ScopeFacet {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeFacet::Count => "count",
            ScopeFacet::Ids => "ids",
            ScopeFacet::Traverse => "traverse",
        }
    }
}

struct ScopeCache {
    epoch: u64,
    entries: LruCache<(String, String), Decision>,
}

/// Per-epoch cached view of the policy's scope rules.
///
/// `AllowFull` exposes every facet; `AllowPartial` exposes the listed facet
/// names (`count`, `ids`, `traverse`).
pub struct ScopeRegulator {
    policy: Arc<PolicyEvaluator>,
    cache: Mutex<ScopeCache>,
}

impl ScopeRegulator {
    pub fn new(policy: Arc<PolicyEvaluator>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let epoch = policy.epoch();
        Self {
            policy,
            cache: Mutex::new(ScopeCache {
                epoch,
                entries: LruCache::new(capacity),
            }),
        }
    }

    fn decision(&self, record_type: &str, scope: &str) -> Decision {
        let snapshot = self.policy.snapshot();
        let mut cache = self.cache.lock();
        if cache.epoch != snapshot.epoch() {
            debug!(from = cache.epoch, to = snapshot.epoch(), "scope cache flushed");
            cache.entries.clear();
            cache.epoch = snapshot.epoch();
        }
        let key = (record_type.to_string(), scope.to_string());
        if let Some(decision) = cache.entries.get(&key) {
            return decision.clone();
        }
        let decision = snapshot.scope_decision(record_type, scope);
        cache.entries.put(key, decision.clone());
        decision
    }

    /// Whether the scope exists for remote access in any form.
    pub fn is_scope_exposed(&self, record_type: &str, scope: &str) -> bool {
        !self.decision(record_type, scope).is_deny()
    }

    pub fn is_facet_exposed(&self, record_type: &str, scope: &str, facet: ScopeFacet) -> bool {
        self.decision(record_type, scope).allows(facet.as_str())
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;

    fn regulator(config: PolicyConfig) -> (Arc<PolicyEvaluator>, ScopeRegulator) {
        let policy = Arc::new(PolicyEvaluator::new(&config).unwrap());
        let regulator = ScopeRegulator::new(Arc::clone(&policy), 16);
        (policy, regulator)
    }

    #[test]
    fn test_unregulated_scope_is_hidden() {
        let (_, regulator) = regulator(
            PolicyConfig::new()
                .always_allow_connection()
                .regulate_scope("Employee", ["pictures"], Decision::AllowFull),
        );
        assert!(regulator.is_scope_exposed("Employee", "pictures"));
        assert!(!regulator.is_scope_exposed("Employee", "all"));
        assert!(!regulator.is_scope_exposed("Product", "pictures"));
    }

    #[test]
    fn test_facets() {
        let (_, regulator) = regulator(PolicyConfig::new().regulate_scope(
            "Group",
            Vec::<String>::new(),
            Decision::partial(["count"]),
        ));
        assert!(regulator.is_scope_exposed("Group", "uzers"));
        assert!(regulator.is_facet_exposed("Group", "uzers", ScopeFacet::Count));
        assert!(!regulator.is_facet_exposed("Group", "uzers", ScopeFacet::Ids));
    }

    #[test]
    fn test_cache_flushed_on_new_epoch() {
        let base = PolicyConfig::new().always_allow_connection();
        let (policy, regulator) = regulator(base.clone());
        assert!(!regulator.is_scope_exposed("Employee", "all"));
        assert_eq!(regulator.cached_entries(), 1);

        policy
            .reload(&base.regulate_scope("Employee", ["all"], Decision::AllowFull))
            .unwrap();
        assert!(regulator.is_scope_exposed("Employee", "all"));
        assert_eq!(regulator.cached_entries(), 1);
    }
}
