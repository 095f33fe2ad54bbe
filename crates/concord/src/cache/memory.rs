use super::{ClusterCache, KeyLock};
use crate::core::{CacheKey, Snapshot};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

type LockTable = DashMap<CacheKey, Arc<Mutex<()>>>;

struct Entry {
    value: Snapshot,
    written: Instant,
}

/// In-process [`ClusterCache`].
///
/// Several directories sharing one `MemoryCache` (through `Arc`) behave like
/// nodes of one cluster. Entries optionally expire `ttl` after their last
/// write, standing in for the eviction a real cache performs on its own.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<CacheKey, Entry>,
    locks: Arc<LockTable>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    /// Creates a cache whose entries never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache whose entries expire `ttl` after their last write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !self.expired(e.value())).count()
    }

    /// Returns `true` if no live entries remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `key` has a live entry.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.get(key).is_some_and(|e| !self.expired(&e))
    }

    fn expired(&self, entry: &Entry) -> bool {
        self.ttl.is_some_and(|ttl| entry.written.elapsed() >= ttl)
    }
}

// Releases the mutex, then drops its table slot unless someone is waiting.
struct HeldLock {
    guard: Option<OwnedMutexGuard<()>>,
    key: CacheKey,
    locks: Arc<LockTable>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

#[async_trait]
impl ClusterCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<Snapshot> {
        if let Some(entry) = self.entries.get(key) {
            if !self.expired(&entry) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }
        self.entries.remove(key);
        None
    }

    async fn put(&self, key: &CacheKey, value: Snapshot) {
        self.entries.insert(
            key.clone(),
            Entry {
                value,
                written: Instant::now(),
            },
        );
    }

    async fn remove(&self, key: &CacheKey) -> Option<Snapshot> {
        let removed = self.entries.remove(key).map(|(_, e)| e);
        removed.filter(|e| !self.expired(e)).map(|e| e.value)
    }

    async fn lock(&self, key: &CacheKey) -> KeyLock {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyLock::new(HeldLock {
            guard: Some(guard),
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        })
    }
}
