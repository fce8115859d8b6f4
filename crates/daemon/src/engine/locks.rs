// Keyed async mutexes: one lock per document or amendment id, created on
// first use.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: RwLock<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self { locks: RwLock::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Copy> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`; released when the guard drops.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        self.lock_for_key(key).await.lock_owned().await
    }

    /// Drops the entry for `key` once nothing else holds it.
    pub async fn forget(&self, key: K) {
        let mut locks = self.locks.write().await;
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    async fn lock_for_key(&self, key: K) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.read().await.get(&key).cloned() {
            return existing;
        }

        let mut locks = self.locks.write().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}
