use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Fixed-capacity least-recently-used cache.
///
/// Owned by whoever needs it (typically a channel factory) and shared by
/// reference; there is no process-wide instance. Lookups move the entry to
/// the front, inserts past capacity evict from the back. Capacities are
/// expected to be small, so a linear scan is fine.
pub struct BoundedCache<K, V> {
    entries: Mutex<VecDeque<(K, V)>>,
    capacity: usize,
}

impl<K: Eq, V: Clone> BoundedCache<K, V> {
    /// A cache holding at most `capacity` entries. A capacity of zero
    /// caches nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let index = entries.iter().position(|(k, _)| k == key)?;
        let entry = entries.remove(index)?;
        let value = entry.1.clone();
        entries.push_front(entry);
        Some(value)
    }

    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = entries.iter().position(|(k, _)| *k == key) {
            entries.remove(index);
        }
        while entries.len() >= self.capacity {
            entries.pop_back();
        }
        entries.push_front((key, value));
    }

    /// Return the cached value for `key`, or compute, cache and return it.
    /// A failed computation caches nothing.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        make: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = make(&key)?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<K, V> fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("BoundedCache")
            .field("len", &len)
            .field("capacity", &self.capacity)
            .finish()
    }
}
