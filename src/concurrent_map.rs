//! A concurrent map with a read-preferring access pattern.
//!
//! The rate sampler keys atomic counters by 1-second epoch buckets. At most
//! one new key is inserted per second, while every in-flight request reads
//! the current bucket. This map takes only a read lock on the hot path and
//! upgrades to a write lock only when the requested key is missing, so
//! concurrent increments never serialize on a mutex.
//!
//! `retain` is provided so the owner can prune stale buckets; it takes the
//! write lock and should be called on an amortized schedule, not per access.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::RwLock,
};

/// A concurrent hash map with read-lock fast path and insert-if-absent.
#[derive(Debug, Default)]
pub struct ConcurrentMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Make a new empty map.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Access the value for `key`, inserting one from `create` if absent.
    ///
    /// The common case (key present) holds only the read lock for the
    /// duration of `access`. Missing keys upgrade to the write lock.
    ///
    /// Note: may deadlock if `create` or `access` re-enters this map.
    pub fn with<R>(&self, key: &K, create: impl FnOnce() -> V, access: impl FnOnce(&V) -> R) -> R {
        {
            let guard = self.inner.read().unwrap();
            if let Some(value) = guard.get(key) {
                return access(value);
            }
        }

        let mut guard = self.inner.write().unwrap();
        let value = guard.entry(key.clone()).or_insert_with(create);
        access(value)
    }

    /// Retain only entries that satisfy the predicate. Returns the number of
    /// entries remaining.
    pub fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) -> usize {
        let mut guard = self.inner.write().unwrap();
        guard.retain(f);
        guard.len()
    }

    /// Number of entries currently in the map.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// True if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
