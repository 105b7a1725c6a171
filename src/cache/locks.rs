//! Per-key exclusive locks guarding cache-file creation.
//!
//! Only the holder of a key's lock may fetch into that key's cache path.
//! Concurrent misses for the same key queue behind the holder and re-check
//! the cache once they get the lock, so the first writer wins and everybody
//! else is served its result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Table of in-flight cache writers keyed by final cache path.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    slots: Arc<Mutex<HashMap<PathBuf, Slot>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` if nobody holds it.
    pub fn try_acquire(&self, key: &Path) -> Option<KeyGuard> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        Some(self.guard_for(key, guard))
    }

    /// Acquire the lock for `key`, waiting at most `timeout`.
    ///
    /// Returns `None` if the lock was still held when the timeout expired.
    pub async fn acquire(&self, key: &Path, timeout: Duration) -> Option<KeyGuard> {
        if let Some(guard) = self.try_acquire(key) {
            return Some(guard);
        }

        debug!(key = %key.display(), "waiting for in-flight cache writer");
        match tokio::time::timeout(timeout, self.slot(key).lock_owned()).await {
            Ok(guard) => Some(self.guard_for(key, guard)),
            Err(_) => {
                warn!(key = %key.display(), ?timeout, "timed out waiting for cache writer");
                self.release_slot(key);
                None
            }
        }
    }

    /// Number of keys with a holder or waiters.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }

    fn slot(&self, key: &Path) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(key.to_path_buf()).or_default())
    }

    fn guard_for(&self, key: &Path, guard: OwnedMutexGuard<()>) -> KeyGuard {
        KeyGuard {
            guard: Some(guard),
            key: key.to_path_buf(),
            locks: self.clone(),
        }
    }

    /// Drop the table entry for `key` once nobody but the table references it.
    fn release_slot(&self, key: &Path) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key)
            && Arc::strong_count(slot) == 1
        {
            slots.remove(key);
        }
    }
}

/// Exclusive right to write one cache key.  Released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: PathBuf,
    locks: KeyLocks,
}

impl KeyGuard {
    pub fn key(&self) -> &Path {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Unlock first so the slot's reference count reflects only waiters.
        drop(self.guard.take());
        self.locks.release_slot(&self.key);
    }
}
