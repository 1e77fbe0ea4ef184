//! Concurrency-safe weak-handle table.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// A concurrency-safe table of non-owning handles.
///
/// The registrar enforces name/identity uniqueness: a key can only be
/// re-registered while its current value is alive if the new value is the
/// *same* allocation. Entries disappear once no strong owner of the value
/// remains; dead entries are swept on access.
///
/// Registration, lookup, and deregistration are atomic with respect to each
/// other (one lock guards the table), so `count` and `is_registered` are
/// consistent with registration ordering.
pub struct Registrar<K, V: ?Sized> {
    entries: RwLock<HashMap<K, Weak<V>>>,
}

impl<K, V> Registrar<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    /// Creates an empty registrar.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `value` under `key`.
    ///
    /// Returns false (and leaves the table unchanged) if the key is held by
    /// a *different* live value. Registering the same allocation again, or
    /// replacing a dead entry, succeeds.
    pub fn register(&self, key: K, value: &Arc<V>) -> bool {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if let Some(live) = existing.upgrade() {
                return Arc::ptr_eq(&live, value);
            }
        }
        entries.insert(key, Arc::downgrade(value));
        true
    }

    /// Returns a strong handle to the value registered under `key`, if it
    /// is still alive.
    #[must_use]
    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read();
        entries.get(key).and_then(Weak::upgrade)
    }

    /// Removes the entry for `key`. Returns true if a live entry was removed.
    pub fn deregister(&self, key: &K) -> bool {
        let mut entries = self.entries.write();
        match entries.remove(key) {
            Some(weak) => weak.upgrade().is_some(),
            None => false,
        }
    }

    /// Returns true if `key` is registered to a live value.
    #[must_use]
    pub fn is_registered(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Returns the number of live entries, sweeping dead ones.
    #[must_use]
    pub fn count(&self) -> usize {
        let mut entries = self.entries.write();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.len()
    }

    /// Returns strong handles to all live values, sweeping dead entries.
    #[must_use]
    pub fn values(&self) -> Vec<Arc<V>> {
        let mut entries = self.entries.write();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.values().filter_map(Weak::upgrade).collect()
    }
}

impl<K, V> Default for Registrar<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}
