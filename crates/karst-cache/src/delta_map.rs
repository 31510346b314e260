//! The three-bucket delta overlay underlying every state cache.
//!
//! A delta tracks *Added*, *Removed*, and *Modified* (copy-on-write) keys
//! relative to an immutable base map. Reads consult the buckets first and
//! fall back to the base; applying a delta replays Removed, then Modified,
//! then Added, so a key that was removed and later re-added ends up present
//! with its newest value.

use std::collections::{BTreeMap, BTreeSet};

/// Mutation overlay over an immutable `BTreeMap` base.
///
/// The base is passed into each operation rather than owned, so the same
/// overlay type serves both borrowed (attached) and owned (detached)
/// deltas.
#[derive(Clone, Debug, Default)]
pub struct DeltaMap<K: Ord + Clone, V: Clone> {
    added: BTreeMap<K, V>,
    removed: BTreeSet<K>,
    modified: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> DeltaMap<K, V> {
    pub fn new() -> Self {
        Self {
            added: BTreeMap::new(),
            removed: BTreeSet::new(),
            modified: BTreeMap::new(),
        }
    }

    /// Look up `key` through the overlay.
    pub fn get<'a>(&'a self, base: &'a BTreeMap<K, V>, key: &K) -> Option<&'a V> {
        if self.removed.contains(key) {
            return None;
        }
        self.added
            .get(key)
            .or_else(|| self.modified.get(key))
            .or_else(|| base.get(key))
    }

    /// Whether `key` is present in the logical union.
    pub fn contains(&self, base: &BTreeMap<K, V>, key: &K) -> bool {
        self.get(base, key).is_some()
    }

    /// Insert or overwrite `key`.
    pub fn insert(&mut self, base: &BTreeMap<K, V>, key: K, value: V) {
        self.removed.remove(&key);
        if base.contains_key(&key) {
            self.added.remove(&key);
            self.modified.insert(key, value);
        } else {
            self.added.insert(key, value);
        }
    }

    /// Remove `key` from the logical union.
    pub fn remove(&mut self, base: &BTreeMap<K, V>, key: &K) {
        if self.added.remove(key).is_some() {
            return;
        }
        self.modified.remove(key);
        if base.contains_key(key) {
            self.removed.insert(key.clone());
        }
    }

    /// Whether no mutations have been recorded.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// The logical union in ascending key order.
    pub fn union_entries<'a>(&'a self, base: &'a BTreeMap<K, V>) -> Vec<(&'a K, &'a V)> {
        let mut union: BTreeMap<&K, &V> = base
            .iter()
            .filter(|(k, _)| !self.removed.contains(*k))
            .collect();
        for (k, v) in &self.modified {
            union.insert(k, v);
        }
        for (k, v) in &self.added {
            union.insert(k, v);
        }
        union.into_iter().collect()
    }

    /// Replay the overlay onto `target`: Removed, then Modified, then Added.
    pub fn apply_to(&self, target: &mut BTreeMap<K, V>) {
        for key in &self.removed {
            target.remove(key);
        }
        for (key, value) in &self.modified {
            target.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.added {
            target.insert(key.clone(), value.clone());
        }
    }

    /// Records that restore `base` when applied over the committed result:
    /// `(key, None)` deletes, `(key, Some(v))` reinstates the base value.
    pub fn undo_records(&self, base: &BTreeMap<K, V>) -> Vec<(K, Option<V>)> {
        let mut records = Vec::new();
        for key in self.added.keys() {
            records.push((key.clone(), None));
        }
        for key in self.modified.keys() {
            if let Some(value) = base.get(key) {
                records.push((key.clone(), Some(value.clone())));
            }
        }
        for key in &self.removed {
            if let Some(value) = base.get(key) {
                records.push((key.clone(), Some(value.clone())));
            }
        }
        records
    }
}
