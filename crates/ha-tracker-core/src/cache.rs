//! The local election cache: an in-memory mirror of the remote KV prefix,
//! kept current via watch callbacks.
//!
//! Grounded on `kimberlite-cluster::supervisor::ClusterSupervisor`'s
//! single-aggregate-behind-one-lock discipline: `elected` and
//! `replica_groups` always change together, under one lock acquisition, so
//! invariant 4 (`replica_groups[t]` is exactly the live keys under `t/`)
//! never observes a half-updated state.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use ha_tracker_types::{Key, ReplicaDesc};

#[derive(Default)]
struct Inner {
    elected: HashMap<String, ReplicaDesc>,
    replica_groups: HashMap<String, HashSet<String>>,
}

/// Thread-safe election cache.
#[derive(Default)]
pub struct Cache {
    inner: RwLock<Inner>,
}

/// Outcome of applying a watch notification to the cache, used by the
/// tracker to decide whether to bump the `elected_replica_changes_total`
/// metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new key was created, or an existing key's replica changed.
    Elected,
    /// The same replica refreshed its heartbeat; no replica change.
    Refreshed,
    /// The key was removed (tombstone observed, or a key lacking a live
    /// value was deleted).
    Removed,
    /// The notification carried a key without the `/` separator and was
    /// ignored.
    IgnoredBadKey,
}

impl Cache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the current entry for `key`, if any, and the current size of
    /// `replica_groups[tenant]`. Both are read under a single shared lock
    /// acquisition so they reflect a consistent snapshot.
    pub fn read(&self, tenant: &str, key: &str) -> (Option<ReplicaDesc>, usize) {
        let inner = self.inner.read().expect("cache lock poisoned");
        let entry = inner.elected.get(key).cloned();
        let group_count = inner
            .replica_groups
            .get(tenant)
            .map(HashSet::len)
            .unwrap_or(0);
        (entry, group_count)
    }

    /// Applies a raw watch notification (`key`, `value`) to the cache.
    ///
    /// `value = None` means the key was explicitly deleted at the KV store
    /// (distinct from a tombstone, which still has `Some(desc)` with
    /// `desc.deleted_at != 0`). Both cases remove the key from the cache.
    pub fn apply(&self, raw_key: &str, value: Option<ReplicaDesc>) -> ApplyOutcome {
        let Some(key) = Key::parse(raw_key) else {
            return ApplyOutcome::IgnoredBadKey;
        };
        let tenant = key.tenant().to_string();
        let full = key.as_str().to_string();

        let mut inner = self.inner.write().expect("cache lock poisoned");

        let is_removal = match &value {
            None => true,
            Some(desc) => !desc.is_live(),
        };

        if is_removal {
            inner.elected.remove(&full);
            if let Some(groups) = inner.replica_groups.get_mut(&tenant) {
                groups.remove(key.replica_group());
                if groups.is_empty() {
                    inner.replica_groups.remove(&tenant);
                }
            }
            return ApplyOutcome::Removed;
        }

        let desc = value.expect("checked is_removal above");
        let previous_replica = inner.elected.get(&full).map(|d| d.replica.clone());
        inner.elected.insert(full, desc.clone());
        inner
            .replica_groups
            .entry(tenant)
            .or_default()
            .insert(key.replica_group().to_string());

        match previous_replica {
            Some(prev) if prev == desc.replica => ApplyOutcome::Refreshed,
            _ => ApplyOutcome::Elected,
        }
    }

    /// Returns a value-copy of the entire live election map.
    pub fn snapshot(&self) -> HashMap<String, ReplicaDesc> {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.elected.clone()
    }

    /// Returns the number of tracked replica groups for `tenant`.
    pub fn group_count(&self, tenant: &str) -> usize {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.replica_groups.get(tenant).map(HashSet::len).unwrap_or(0)
    }

    /// Returns all tenants with at least one tracked group, for the
    /// group-count refresher.
    pub fn tenants(&self) -> Vec<String> {
        let inner = self.inner.read().expect("cache lock poisoned");
        inner.replica_groups.keys().cloned().collect()
    }

    /// Drops all cached state for `tenant`, used alongside
    /// `cleanup_metrics_for_tenant` when a tenant departs.
    pub fn drop_tenant(&self, tenant: &str) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        if let Some(groups) = inner.replica_groups.remove(tenant) {
            for group in groups {
                let full = Key::new(tenant, &group).as_str().to_string();
                inner.elected.remove(&full);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_tracker_types::Timestamp;

    fn desc(replica: &str, received_at: i64) -> ReplicaDesc {
        ReplicaDesc::elect(replica, Timestamp::from_millis(received_at))
    }

    #[test]
    fn apply_create_then_read() {
        let cache = Cache::new();
        let outcome = cache.apply("t1/g1", Some(desc("R1", 0)));
        assert_eq!(outcome, ApplyOutcome::Elected);

        let (entry, count) = cache.read("t1", "t1/g1");
        assert_eq!(entry.unwrap().replica, "R1");
        assert_eq!(count, 1);
    }

    #[test]
    fn apply_same_replica_is_refresh_not_election() {
        let cache = Cache::new();
        cache.apply("t1/g1", Some(desc("R1", 0)));
        let outcome = cache.apply("t1/g1", Some(desc("R1", 5_000)));
        assert_eq!(outcome, ApplyOutcome::Refreshed);
    }

    #[test]
    fn apply_different_replica_is_election() {
        let cache = Cache::new();
        cache.apply("t1/g1", Some(desc("R1", 0)));
        let outcome = cache.apply("t1/g1", Some(desc("R2", 55_000)));
        assert_eq!(outcome, ApplyOutcome::Elected);
        let (entry, _) = cache.read("t1", "t1/g1");
        assert_eq!(entry.unwrap().replica, "R2");
    }

    #[test]
    fn tombstone_removes_entry_and_drops_empty_tenant() {
        let cache = Cache::new();
        cache.apply("t1/g1", Some(desc("R1", 0)));
        assert_eq!(cache.group_count("t1"), 1);

        let tomb = desc("R1", 0).tombstoned(Timestamp::from_millis(1_800_000));
        let outcome = cache.apply("t1/g1", Some(tomb));
        assert_eq!(outcome, ApplyOutcome::Removed);

        let (entry, count) = cache.read("t1", "t1/g1");
        assert!(entry.is_none());
        assert_eq!(count, 0);
        assert!(cache.tenants().is_empty());
    }

    #[test]
    fn explicit_delete_removes_entry() {
        let cache = Cache::new();
        cache.apply("t1/g1", Some(desc("R1", 0)));
        let outcome = cache.apply("t1/g1", None);
        assert_eq!(outcome, ApplyOutcome::Removed);
        assert!(cache.read("t1", "t1/g1").0.is_none());
    }

    #[test]
    fn keys_without_separator_are_ignored() {
        let cache = Cache::new();
        let outcome = cache.apply("no-separator", Some(desc("R1", 0)));
        assert_eq!(outcome, ApplyOutcome::IgnoredBadKey);
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn replica_groups_contains_exactly_live_keys_for_tenant() {
        let cache = Cache::new();
        cache.apply("t1/g1", Some(desc("R1", 0)));
        cache.apply("t1/g2", Some(desc("R1", 0)));
        cache.apply("t2/g1", Some(desc("R1", 0)));
        assert_eq!(cache.group_count("t1"), 2);
        assert_eq!(cache.group_count("t2"), 1);

        cache.apply("t1/g1", None);
        assert_eq!(cache.group_count("t1"), 1);
    }

    #[test]
    fn drop_tenant_clears_all_its_keys() {
        let cache = Cache::new();
        cache.apply("t1/g1", Some(desc("R1", 0)));
        cache.apply("t1/g2", Some(desc("R1", 0)));
        cache.drop_tenant("t1");
        assert_eq!(cache.group_count("t1"), 0);
        assert!(cache.read("t1", "t1/g1").0.is_none());
        assert!(cache.read("t1", "t1/g2").0.is_none());
    }
}
