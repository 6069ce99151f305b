//! Async locks keyed by value.
//!
//! Used to serialize mutations of one channel (or one connection/channel
//! pair) while leaving every other key free to proceed. Entries exist only
//! while someone holds or waits for the lock.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable<K> = DashMap<K, Arc<Mutex<()>>>;

/// A table of async mutexes, one per key.
pub struct KeyedLock<K: Eq + Hash> {
    locks: Arc<LockTable<K>>,
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let mutex = Arc::clone(&self.locks.entry(key.clone()).or_default());
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyedGuard<K: Eq + Hash> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable<K>>,
}

impl<K: Eq + Hash> KeyedGuard<K> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a clone of the Arc, so a count of one means nobody
        // else wants this key.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
