//! Keyed lock manager - async mutual exclusion per (namespace, key)

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockKey = (String, String);
type LockTable = DashMap<LockKey, Arc<Mutex<()>>>;

/// Hands out exclusive locks scoped to a `(namespace, key)` pair.
///
/// Callers asking for the same pair are queued behind the current holder;
/// callers asking for any other pair, including a different key in the same
/// namespace, proceed immediately. Entries are created on first use and
/// dropped from the table once no handle or waiter refers to them.
#[derive(Debug, Default)]
pub struct KeyedLocker {
    locks: Arc<LockTable>,
}

impl KeyedLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `namespace` + `key`, waiting for the current
    /// holder if there is one.
    pub async fn lock(&self, namespace: impl Into<String>, key: impl Into<String>) -> DocLock {
        // Built before waiting so a caller that gives up still drops it and
        // cleans the entry. The mutex `Arc` moves into the acquire future,
        // which is dropped ahead of this handle.
        let mut lock = DocLock {
            key: (namespace.into(), key.into()),
            locks: self.locks.clone(),
            guard: None,
        };
        let mutex = self.mutex_for(&lock.key);

        trace!(namespace = %lock.key.0, key = %lock.key.1, "Waiting for lock");
        lock.guard = Some(mutex.lock_owned().await);
        trace!(namespace = %lock.key.0, key = %lock.key.1, "Lock acquired");

        lock
    }

    /// Acquire the lock only if nobody holds it right now
    pub fn try_lock(&self, namespace: impl Into<String>, key: impl Into<String>) -> Option<DocLock> {
        let key = (namespace.into(), key.into());
        let mutex = self.mutex_for(&key);

        match mutex.try_lock_owned() {
            Ok(guard) => Some(DocLock {
                key,
                locks: self.locks.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                // The holder will clean up the entry on release.
                None
            }
        }
    }

    /// Number of keys currently tracked (held or waited on)
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn mutex_for(&self, key: &LockKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

/// Scoped lock handle returned by [`KeyedLocker::lock`].
///
/// The lock is released when the handle is dropped, on every exit path.
pub struct DocLock {
    key: LockKey,
    locks: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DocLock {
    pub fn namespace(&self) -> &str {
        &self.key.0
    }

    pub fn key(&self) -> &str {
        &self.key.1
    }
}

impl Drop for DocLock {
    fn drop(&mut self) {
        // Release first so the table entry is the only remaining reference
        // when nobody else is waiting.
        let held = self.guard.take().is_some();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        if held {
            trace!(namespace = %self.key.0, key = %self.key.1, "Lock released");
        }
    }
}

impl std::fmt::Debug for DocLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocLock")
            .field("namespace", &self.key.0)
            .field("key", &self.key.1)
            .finish()
    }
}
