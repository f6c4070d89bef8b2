use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Replicated Store - Last-Write-Wins Register per Key
// ============================================================================

/// Value held for a key together with the time it was last written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

impl StoredValue {
    pub fn new(value: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            updated_at,
        }
    }
}

/// Concurrent key-value store with last-write-wins merge.
///
/// Cloning is cheap and every clone shares the same map. Value and timestamp
/// are replaced together under the per-key DashMap lock, so readers never see
/// a value paired with another write's timestamp.
///
/// Deletes leave a tombstone holding the delete time. A remote value that is
/// not newer than the tombstone is rejected, so a delayed older write cannot
/// bring a deleted key back. Tombstones live until [`prune_tombstones`]
/// drops them.
///
/// [`prune_tombstones`]: ReplicatedStore::prune_tombstones
#[derive(Debug, Clone, Default)]
pub struct ReplicatedStore {
    data: Arc<DashMap<String, StoredValue>>,
    tombstones: Arc<DashMap<String, DateTime<Utc>>>,
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local write. Always wins and returns the timestamp it was stamped with.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> DateTime<Utc> {
        let key = key.into();
        let updated_at = Utc::now();
        debug!(key = %key, "Store set");
        self.unbury(&key, updated_at);
        self.data.insert(key, StoredValue::new(value, updated_at));
        updated_at
    }

    /// Point read.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|entry| entry.value().value.clone())
    }

    /// Point read including the last-update timestamp.
    pub fn get_entry(&self, key: &str) -> Option<StoredValue> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Unconditional removal stamped with the current time. Returns whether
    /// the key was present.
    pub fn delete(&self, key: &str) -> bool {
        debug!(key = %key, "Store delete");
        self.record_tombstone(key, Utc::now());
        self.data.remove(key).is_some()
    }

    /// Remove `key` unless the local entry was written after `at`. The delete
    /// time is remembered even when nothing was removed.
    pub fn delete_if_not_newer(&self, key: &str, at: DateTime<Utc>) -> bool {
        self.record_tombstone(key, at);
        self.data
            .remove_if(key, |_, current| current.updated_at <= at)
            .is_some()
    }

    /// Latest delete time recorded for `key`.
    pub fn tombstone(&self, key: &str) -> Option<DateTime<Utc>> {
        self.tombstones.get(key).map(|entry| *entry.value())
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Drop tombstones for deletes made before `cutoff`. Returns how many
    /// were dropped.
    pub fn prune_tombstones(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, deleted_at| *deleted_at >= cutoff);
        let pruned = before.saturating_sub(self.tombstones.len());
        if pruned > 0 {
            debug!(pruned, "Pruned tombstones");
        }
        pruned
    }

    // Recorded before the value is removed so a concurrent merge either sees
    // the tombstone or has its value removed by the delete.
    fn record_tombstone(&self, key: &str, at: DateTime<Utc>) {
        self.tombstones
            .entry(key.to_string())
            .and_modify(|deleted_at| {
                if at > *deleted_at {
                    *deleted_at = at;
                }
            })
            .or_insert(at);
    }

    fn unbury(&self, key: &str, written_at: DateTime<Utc>) {
        self.tombstones
            .remove_if(key, |_, deleted_at| *deleted_at < written_at);
    }

    fn buried(&self, key: &str, remote: &StoredValue) -> bool {
        self.tombstones
            .get(key)
            .is_some_and(|deleted_at| remote.updated_at <= *deleted_at.value())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Full snapshot of the store.
    pub fn export(&self) -> BTreeMap<String, StoredValue> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Merge a single remote entry. The remote value is adopted when its
    /// timestamp is strictly newer than both the local value and any
    /// tombstone for the key; ties keep the local state. Returns whether the
    /// remote value was adopted.
    pub fn merge_entry(&self, key: String, remote: StoredValue) -> bool {
        if self.buried(&key, &remote) {
            debug!(key = %key, "Remote value predates delete, ignoring");
            return false;
        }
        match self.data.entry(key) {
            Entry::Occupied(mut entry) => {
                if remote.updated_at > entry.get().updated_at {
                    debug!(key = %entry.key(), "Remote value is newer, adopting");
                    self.unbury(entry.key(), remote.updated_at);
                    entry.insert(remote);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                debug!(key = %entry.key(), "Key not found locally, adopting remote value");
                self.unbury(entry.key(), remote.updated_at);
                entry.insert(remote);
                true
            }
        }
    }

    /// Merge a remote snapshot key by key. Keys missing from the snapshot are
    /// left untouched; deletion only ever happens explicitly.
    pub fn merge_remote(&self, remote: BTreeMap<String, StoredValue>) -> usize {
        let total = remote.len();
        let adopted = remote
            .into_iter()
            .filter(|(key, value)| self.merge_entry(key.clone(), value.clone()))
            .count();
        debug!(total, adopted, "Merged remote snapshot");
        adopted
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use chrono::Duration;

    use super::*;

    fn snapshot(entries: &[(&str, &str, DateTime<Utc>)]) -> BTreeMap<String, StoredValue> {
        entries
            .iter()
            .map(|(k, v, t)| (k.to_string(), StoredValue::new(*v, *t)))
            .collect()
    }

    #[test]
    fn test_set_get_delete() {
        let store = ReplicatedStore::new();
        assert_eq!(store.get("k"), None);

        store.set("k", "v1");
        assert_eq!(store.get("k").as_deref(), Some("v1"));

        store.set("k", "v2");
        assert_eq!(store.get("k").as_deref(), Some("v2"));

        assert!(store.delete("k"));
        assert_eq!(store.get("k"), None);
        assert!(!store.delete("k"));
    }

    #[test]
    fn test_local_set_always_wins() {
        let store = ReplicatedStore::new();
        let future = Utc::now() + Duration::hours(1);
        store.merge_entry("k".into(), StoredValue::new("remote", future));

        store.set("k", "local");
        assert_eq!(store.get("k").as_deref(), Some("local"));
    }

    #[test]
    fn test_merge_converges_regardless_of_order() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::milliseconds(5);

        let forward = ReplicatedStore::new();
        forward.merge_remote(snapshot(&[("k", "v1", t1)]));
        forward.merge_remote(snapshot(&[("k", "v2", t2)]));

        let reverse = ReplicatedStore::new();
        reverse.merge_remote(snapshot(&[("k", "v2", t2)]));
        reverse.merge_remote(snapshot(&[("k", "v1", t1)]));

        assert_eq!(forward.get_entry("k"), Some(StoredValue::new("v2", t2)));
        assert_eq!(forward.export(), reverse.export());
    }

    #[test]
    fn test_merge_tie_keeps_local_value() {
        let store = ReplicatedStore::new();
        let t = Utc::now();
        store.merge_entry("k".into(), StoredValue::new("local", t));

        let adopted = store.merge_entry("k".into(), StoredValue::new("remote", t));
        assert!(!adopted);
        assert_eq!(store.get("k").as_deref(), Some("local"));
    }

    #[test]
    fn test_merge_never_regresses_timestamp() {
        let store = ReplicatedStore::new();
        let newer = Utc::now();
        let older = newer - Duration::seconds(10);
        store.merge_entry("k".into(), StoredValue::new("new", newer));

        assert!(!store.merge_entry("k".into(), StoredValue::new("old", older)));
        assert_eq!(store.get_entry("k").unwrap().updated_at, newer);
    }

    #[test]
    fn test_merge_does_not_resurrect_or_delete() {
        let store = ReplicatedStore::new();
        store.set("gone", "v");
        store.set("kept", "v");
        store.delete("gone");

        let t = Utc::now();
        store.merge_remote(snapshot(&[("other", "x", t)]));

        assert!(!store.contains_key("gone"));
        assert!(store.contains_key("kept"));
        assert!(store.contains_key("other"));
    }

    #[test]
    fn test_delete_if_not_newer() {
        let store = ReplicatedStore::new();
        let t = Utc::now();
        store.merge_entry("k".into(), StoredValue::new("v", t));

        assert!(!store.delete_if_not_newer("k", t - Duration::seconds(1)));
        assert!(store.contains_key("k"));

        assert!(store.delete_if_not_newer("k", t));
        assert!(!store.contains_key("k"));
        assert!(!store.delete_if_not_newer("k", t));
    }

    #[test]
    fn test_delete_rejects_older_remote_value() {
        let store = ReplicatedStore::new();
        let t1 = Utc::now();
        let t2 = t1 + Duration::milliseconds(5);

        // Delete arrives before the write it supersedes.
        assert!(!store.delete_if_not_newer("x", t2));
        assert_eq!(store.tombstone("x"), Some(t2));

        assert!(!store.merge_entry("x".into(), StoredValue::new("1", t1)));
        assert!(!store.merge_entry("x".into(), StoredValue::new("tie", t2)));
        assert!(!store.contains_key("x"));
    }

    #[test]
    fn test_newer_remote_value_replaces_tombstone() {
        let store = ReplicatedStore::new();
        let t1 = Utc::now();
        let t2 = t1 + Duration::milliseconds(5);
        store.delete_if_not_newer("x", t1);

        assert!(store.merge_entry("x".into(), StoredValue::new("2", t2)));
        assert_eq!(store.get("x").as_deref(), Some("2"));
        assert_eq!(store.tombstone("x"), None);
    }

    #[test]
    fn test_tombstone_keeps_latest_delete_time() {
        let store = ReplicatedStore::new();
        let t1 = Utc::now();
        let t2 = t1 + Duration::milliseconds(5);

        store.delete_if_not_newer("x", t2);
        store.delete_if_not_newer("x", t1);
        assert_eq!(store.tombstone("x"), Some(t2));
    }

    #[test]
    fn test_local_set_clears_tombstone() {
        let store = ReplicatedStore::new();
        store.set("x", "1");
        store.delete("x");
        assert!(store.tombstone("x").is_some());

        store.set("x", "2");
        assert_eq!(store.tombstone("x"), None);
        assert_eq!(store.get("x").as_deref(), Some("2"));
    }

    #[test]
    fn test_prune_tombstones() {
        let store = ReplicatedStore::new();
        let now = Utc::now();
        store.delete_if_not_newer("old", now - Duration::minutes(30));
        store.delete_if_not_newer("recent", now);

        assert_eq!(store.prune_tombstones(now - Duration::minutes(10)), 1);
        assert_eq!(store.tombstone_count(), 1);
        assert!(store.tombstone("recent").is_some());

        // Once pruned, an old value is accepted again.
        assert!(store.merge_entry(
            "old".into(),
            StoredValue::new("v", now - Duration::hours(1))
        ));
    }

    #[test]
    fn test_export_is_a_snapshot() {
        let store = ReplicatedStore::new();
        store.set("a", "1");
        store.set("b", "2");

        let exported = store.export();
        store.delete("a");

        assert_eq!(exported.len(), 2);
        assert_eq!(exported["a"].value, "1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_merges_keep_newest() {
        let store = ReplicatedStore::new();
        let base = Utc::now();
        let mut handles = vec![];

        for i in 0..8i64 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for j in 0..100i64 {
                    let at = base + Duration::milliseconds(i * 100 + j);
                    store.merge_entry("hot".into(), StoredValue::new(format!("{i}-{j}"), at));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let newest = base + Duration::milliseconds(7 * 100 + 99);
        assert_eq!(store.get_entry("hot"), Some(StoredValue::new("7-99", newest)));
    }
}
