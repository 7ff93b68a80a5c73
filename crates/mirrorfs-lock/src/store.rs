//! Generic keyed lock store
//!
//! A [`LockStore`] hands out scoped [`LockToken`]s for opaque keys. Entries
//! are created on first use and removed again once the last token (or
//! waiter) for a key is gone, so the table only holds keys that are in use.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, watch};
use tokio::time::Instant;
use tracing::debug;

/// Lock store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock store {0} is shut down")]
    Unavailable(&'static str),

    #[error("timed out waiting for lock in store {0}")]
    Timeout(&'static str),
}

impl From<LockError> for mirrorfs_common::Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Unavailable(_) => Self::Unavailable(err.to_string()),
            LockError::Timeout(_) => Self::Timeout,
        }
    }
}

/// Access mode of a lock token
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

type Slot = Arc<RwLock<()>>;

struct Shared<K> {
    name: &'static str,
    table: Mutex<HashMap<K, Slot>>,
}

impl<K: Eq + Hash> Shared<K> {
    fn release(&self, key: &K) {
        let mut table = self.table.lock();
        if let Some(slot) = table.get(key)
            && Arc::strong_count(slot) == 1
        {
            table.remove(key);
        }
    }
}

/// A table of async reader/writer locks indexed by key
pub struct LockStore<K> {
    shared: Arc<Shared<K>>,
    shutdown: watch::Sender<bool>,
}

impl<K> LockStore<K>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
{
    /// Create an empty store; `name` identifies the lock domain in errors and logs
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name,
                table: Mutex::new(HashMap::new()),
            }),
            shutdown,
        }
    }

    /// Name of the lock domain
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Acquire a token for `key`, waiting as long as needed.
    ///
    /// Fails only when the store is shut down.
    pub async fn acquire(&self, key: K, mode: LockMode) -> Result<LockToken<K>, LockError> {
        self.acquire_inner(key, mode, None).await
    }

    /// Acquire a token for `key`, giving up after `timeout`
    pub async fn acquire_timeout(
        &self,
        key: K,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockToken<K>, LockError> {
        self.acquire_inner(key, mode, Some(Instant::now() + timeout))
            .await
    }

    /// Acquire a token for `key`, giving up at `deadline`
    pub async fn acquire_until(
        &self,
        key: K,
        mode: LockMode,
        deadline: Instant,
    ) -> Result<LockToken<K>, LockError> {
        self.acquire_inner(key, mode, Some(deadline)).await
    }

    async fn acquire_inner(
        &self,
        key: K,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Result<LockToken<K>, LockError> {
        let name = self.shared.name;
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(LockError::Unavailable(name));
        }

        let slot = {
            let mut table = self.shared.table.lock();
            Arc::clone(table.entry(key.clone()).or_default())
        };

        let guard = async {
            match mode {
                LockMode::Read => Guard::Read(slot.read_owned().await),
                LockMode::Write => Guard::Write(slot.write_owned().await),
            }
        };
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        // Every early return drops the cloned slot before releasing the key.
        let outcome = tokio::select! {
            guard = guard => Ok(guard),
            _ = shutdown.wait_for(|down| *down) => Err(LockError::Unavailable(name)),
            () = expired => Err(LockError::Timeout(name)),
        };

        match outcome {
            Ok(guard) => Ok(LockToken {
                guard: Some(guard),
                key,
                mode,
                shared: Arc::clone(&self.shared),
            }),
            Err(err) => {
                debug!(store = name, ?key, "lock acquisition failed: {}", err);
                self.shared.release(&key);
                Err(err)
            }
        }
    }

    /// Refuse all further acquisitions and wake up every waiter with `Unavailable`.
    ///
    /// Tokens already handed out stay valid until dropped.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of keys currently held or waited on
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.shared.table.lock().len()
    }
}

impl<K> fmt::Debug for LockStore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockStore")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

enum Guard {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Scoped ownership of one key in a [`LockStore`].
///
/// The lock is released when the token is dropped.
#[must_use = "the lock is released as soon as the token is dropped"]
pub struct LockToken<K: Eq + Hash> {
    guard: Option<Guard>,
    key: K,
    mode: LockMode,
    shared: Arc<Shared<K>>,
}

impl<K: Eq + Hash> LockToken<K> {
    #[must_use]
    pub const fn key(&self) -> &K {
        &self.key
    }

    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl<K: Eq + Hash> Drop for LockToken<K> {
    fn drop(&mut self) {
        // The guard holds a reference to the slot; it has to go first.
        drop(self.guard.take());
        self.shared.release(&self.key);
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for LockToken<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("store", &self.shared.name)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}
