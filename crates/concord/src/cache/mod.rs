//! Cluster-wide snapshot cache with per-key locking.
//!
//! # Architecture
//!
//! The cache holds the canonical hot [`Snapshot`] of every online contact and
//! recently active group, shared by all nodes. Reads go straight to
//! [`ClusterCache::get`]. Read-modify-write sequences go through
//! [`apply`](trait.ClusterCache.html#method.apply), which serializes them
//! cluster-wide on a single key:
//!
//! 1. acquire the lock for the key ([`ClusterCache::lock`])
//! 2. read the current snapshot into a [`LockedEntry`]
//! 3. run the caller's closure against the entry
//! 4. write back whatever the closure staged
//! 5. release the lock when the [`KeyLock`] guard drops
//!
//! The whole sequence is bounded by a timeout. Cancelling it at any point
//! drops the guard, so the lock is never leaked.
//!
//! # Example
//!
//! ```ignore
//! let merged = cache
//!     .apply(&CacheKey::contact(&key), timeout, |entry| {
//!         let mut contact: Contact = entry.decode()?.unwrap_or(incoming);
//!         contact.upsert_device(device);
//!         entry.put_value(&contact)?;
//!         Ok::<_, PresenceError>(contact)
//!     })
//!     .await??;
//! ```

mod memory;

pub use memory::MemoryCache;

use crate::core::{CacheKey, CodecError, Snapshot};
use crate::error::PresenceError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::time::Duration;

/// Guard for a cluster lock on one key. The lock is released on drop.
pub struct KeyLock {
    _guard: Box<dyn Any + Send + Sync>,
}

impl KeyLock {
    /// Wraps a transport-specific guard.
    pub fn new(guard: impl Any + Send + Sync) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for KeyLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyLock")
    }
}

/// Transport seam for the cluster cache.
///
/// Implementations must not fail: an unreachable cache behaves like an empty
/// one, which is what callers fall back to anyway.
#[async_trait]
pub trait ClusterCache: Send + Sync + 'static {
    /// Non-locking read.
    async fn get(&self, key: &CacheKey) -> Option<Snapshot>;

    /// Unconditional write.
    async fn put(&self, key: &CacheKey, value: Snapshot);

    /// Deletes an entry, returning the old value.
    async fn remove(&self, key: &CacheKey) -> Option<Snapshot>;

    /// Waits for the cluster lock on `key`.
    async fn lock(&self, key: &CacheKey) -> KeyLock;
}

impl dyn ClusterCache {
    /// Runs `f` against `key` while holding its cluster lock.
    ///
    /// Returns [`PresenceError::LockTimeout`] if the lock, read, closure and
    /// write-back together take longer than `timeout`. Nothing staged by the
    /// closure is written in that case.
    pub async fn apply<T, F>(&self, key: &CacheKey, timeout: Duration, f: F) -> Result<T, PresenceError>
    where
        F: FnOnce(&mut LockedEntry) -> T + Send,
        T: Send,
    {
        let locked = async {
            let _lock = self.lock(key).await;
            let mut entry = LockedEntry::new(self.get(key).await);
            let out = f(&mut entry);
            match entry.staged {
                Staged::Untouched => {}
                Staged::Put(value) => self.put(key, value).await,
                Staged::Remove => {
                    self.remove(key).await;
                }
            }
            out
        };

        tokio::time::timeout(timeout, locked)
            .await
            .map_err(|_| PresenceError::LockTimeout {
                key: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Reads and decodes a value without locking.
    pub async fn get_value<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CodecError> {
        self.get(key).await.map(|s| s.decode()).transpose()
    }

    /// Encodes and writes a value without locking.
    pub async fn put_value<T: Serialize + Sync>(&self, key: &CacheKey, value: &T) -> Result<(), CodecError> {
        let snapshot = Snapshot::of(value)?;
        self.put(key, snapshot).await;
        Ok(())
    }
}

enum Staged {
    Untouched,
    Put(Snapshot),
    Remove,
}

/// A cache entry as seen from inside [`apply`](trait.ClusterCache.html#method.apply).
///
/// Writes are staged and committed when the closure returns.
pub struct LockedEntry {
    current: Option<Snapshot>,
    staged: Staged,
}

impl LockedEntry {
    fn new(current: Option<Snapshot>) -> Self {
        Self {
            current,
            staged: Staged::Untouched,
        }
    }

    /// The value as of lock acquisition, or as staged since.
    pub fn get(&self) -> Option<&Snapshot> {
        match &self.staged {
            Staged::Untouched => self.current.as_ref(),
            Staged::Put(value) => Some(value),
            Staged::Remove => None,
        }
    }

    /// Stages a write.
    pub fn put(&mut self, value: Snapshot) {
        self.staged = Staged::Put(value);
    }

    /// Stages a delete.
    pub fn remove(&mut self) {
        self.staged = Staged::Remove;
    }

    /// Decodes the visible value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, CodecError> {
        self.get().map(|s| s.decode()).transpose()
    }

    /// Encodes and stages a write.
    pub fn put_value<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        self.put(Snapshot::of(value)?);
        Ok(())
    }
}
