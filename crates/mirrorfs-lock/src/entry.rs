//! Entry and chunk lock domains with canonical acquisition order
//!
//! Operations that touch several objects declare a list of [`LockRequest`]s.
//! [`LockManager::lock_all`] sorts and de-duplicates the list before taking
//! any lock, so two operations needing overlapping keys always acquire them
//! in the same order:
//!
//! 1. hash-dir bucket
//! 2. directory ID, ordered by `(id, write)`
//! 3. dentry name, ordered by `(parent, name)`
//! 4. file ID
//! 5. chunk, ordered by `(target, path)`

use crate::store::{LockError, LockMode, LockStore, LockToken};
use mirrorfs_common::{EntryId, TargetId};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Number of hash-dir buckets (two levels of 128)
pub const HASH_DIR_BUCKETS: u32 = 128 * 128;

/// Bucket of the hash-dir tree an entry ID falls into
#[must_use]
pub fn hash_dir_bucket(id: &EntryId) -> u32 {
    let hash = xxhash_rust::xxh64::xxh64(id.as_bytes(), 0);
    (hash % u64::from(HASH_DIR_BUCKETS)) as u32
}

/// One lock an operation needs.
///
/// The derived ordering is the canonical acquisition order: by variant
/// first, then by the fields in declaration order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRequest {
    HashDir(u32),
    DirId { id: EntryId, write: bool },
    ParentName { parent: EntryId, name: String },
    FileId(EntryId),
    Chunk { target: TargetId, path: String },
}

impl LockRequest {
    /// Hash-dir bucket lock for an entry ID
    #[must_use]
    pub fn hash_dir_of(id: &EntryId) -> Self {
        Self::HashDir(hash_dir_bucket(id))
    }

    #[must_use]
    pub fn dir_read(id: EntryId) -> Self {
        Self::DirId { id, write: false }
    }

    #[must_use]
    pub fn dir_write(id: EntryId) -> Self {
        Self::DirId { id, write: true }
    }

    #[must_use]
    pub fn parent_name(parent: EntryId, name: impl Into<String>) -> Self {
        Self::ParentName {
            parent,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn chunk(target: TargetId, path: impl Into<String>) -> Self {
        Self::Chunk {
            target,
            path: path.into(),
        }
    }
}

/// Sort `requests` into canonical order and drop duplicates.
///
/// A write lock on a directory ID subsumes a read lock on the same ID.
#[must_use]
pub fn canonicalize(mut requests: Vec<LockRequest>) -> Vec<LockRequest> {
    requests.sort();
    requests.dedup();

    let mut out: Vec<LockRequest> = Vec::with_capacity(requests.len());
    for request in requests {
        if let (
            Some(LockRequest::DirId {
                id: prev,
                write: prev_write,
            }),
            LockRequest::DirId { id, write: true },
        ) = (out.last_mut(), &request)
            && *prev == *id
        {
            // Sorting puts the read request right before the write request.
            *prev_write = true;
            continue;
        }
        out.push(request);
    }
    out
}

/// Directory ID lock key
pub type DirKey = EntryId;
/// Dentry lock key: parent directory and name
pub type ParentNameKey = (EntryId, String);
/// Chunk lock key: target and chunk path
pub type ChunkKey = (TargetId, String);

/// Lock domains for metadata entries
#[derive(Debug)]
pub struct EntryLockStore {
    hash_dirs: LockStore<u32>,
    dirs: LockStore<DirKey>,
    names: LockStore<ParentNameKey>,
    files: LockStore<EntryId>,
}

impl Default for EntryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hash_dirs: LockStore::new("hash-dir"),
            dirs: LockStore::new("dir-id"),
            names: LockStore::new("parent-name"),
            files: LockStore::new("file-id"),
        }
    }

    pub fn shutdown(&self) {
        self.hash_dirs.shutdown();
        self.dirs.shutdown();
        self.names.shutdown();
        self.files.shutdown();
    }
}

/// Chunk lock domain, shared by live chunk I/O and resync repair writes
#[derive(Debug)]
pub struct ChunkLockStore {
    chunks: LockStore<ChunkKey>,
}

impl Default for ChunkLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: LockStore::new("chunk"),
        }
    }

    /// Exclusive lock on one chunk, waiting at most `timeout`
    pub async fn lock(
        &self,
        target: TargetId,
        path: &str,
        timeout: Duration,
    ) -> Result<LockToken<ChunkKey>, LockError> {
        self.chunks
            .acquire_timeout((target, path.to_string()), LockMode::Write, timeout)
            .await
    }

    /// Number of chunks currently locked or waited on
    #[must_use]
    pub fn active(&self) -> usize {
        self.chunks.active_keys()
    }

    pub fn shutdown(&self) {
        self.chunks.shutdown();
    }
}

/// A held lock of any domain
#[derive(Debug)]
pub enum HeldLock {
    HashDir(LockToken<u32>),
    Dir(LockToken<DirKey>),
    Name(LockToken<ParentNameKey>),
    File(LockToken<EntryId>),
    Chunk(LockToken<ChunkKey>),
}

/// All locks of one operation; released together on drop
#[derive(Debug, Default)]
#[must_use = "locks are released as soon as the set is dropped"]
pub struct LockSet {
    held: Vec<HeldLock>,
}

impl LockSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.held.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        // Release in reverse acquisition order.
        while let Some(lock) = self.held.pop() {
            drop(lock);
        }
    }
}

/// Every lock domain of a node
#[derive(Debug, Default)]
pub struct LockManager {
    entries: EntryLockStore,
    chunks: ChunkLockStore,
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn entries(&self) -> &EntryLockStore {
        &self.entries
    }

    #[must_use]
    pub const fn chunks(&self) -> &ChunkLockStore {
        &self.chunks
    }

    /// Acquire every lock in `requests` in canonical order.
    ///
    /// `timeout` bounds the whole acquisition; on failure the locks taken so
    /// far are released before returning.
    pub async fn lock_all(
        &self,
        requests: Vec<LockRequest>,
        timeout: Duration,
    ) -> Result<LockSet, LockError> {
        let deadline = Instant::now() + timeout;
        let mut set = LockSet::default();

        for request in canonicalize(requests) {
            trace!(?request, "acquiring lock");
            let held = match request {
                LockRequest::HashDir(bucket) => HeldLock::HashDir(
                    self.entries
                        .hash_dirs
                        .acquire_until(bucket, LockMode::Write, deadline)
                        .await?,
                ),
                LockRequest::DirId { id, write } => {
                    let mode = if write { LockMode::Write } else { LockMode::Read };
                    HeldLock::Dir(self.entries.dirs.acquire_until(id, mode, deadline).await?)
                }
                LockRequest::ParentName { parent, name } => HeldLock::Name(
                    self.entries
                        .names
                        .acquire_until((parent, name), LockMode::Write, deadline)
                        .await?,
                ),
                LockRequest::FileId(id) => HeldLock::File(
                    self.entries
                        .files
                        .acquire_until(id, LockMode::Write, deadline)
                        .await?,
                ),
                LockRequest::Chunk { target, path } => HeldLock::Chunk(
                    self.chunks
                        .chunks
                        .acquire_until((target, path), LockMode::Write, deadline)
                        .await?,
                ),
            };
            set.held.push(held);
        }

        Ok(set)
    }

    /// Shut down every domain; pending and future acquisitions fail with `Unavailable`
    pub fn shutdown(&self) {
        self.entries.shutdown();
        self.chunks.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> EntryId {
        EntryId::new(s)
    }

    #[test]
    fn test_canonical_order_is_independent_of_input_order() {
        let a = vec![
            LockRequest::FileId(id("F1")),
            LockRequest::parent_name(id("D2"), "b"),
            LockRequest::dir_write(id("D2")),
            LockRequest::dir_write(id("D1")),
            LockRequest::parent_name(id("D1"), "a"),
            LockRequest::HashDir(9),
        ];
        let mut b = a.clone();
        b.reverse();

        let ca = canonicalize(a);
        assert_eq!(ca, canonicalize(b));
        assert_eq!(
            ca,
            vec![
                LockRequest::HashDir(9),
                LockRequest::dir_write(id("D1")),
                LockRequest::dir_write(id("D2")),
                LockRequest::parent_name(id("D1"), "a"),
                LockRequest::parent_name(id("D2"), "b"),
                LockRequest::FileId(id("F1")),
            ]
        );
    }

    #[test]
    fn test_write_subsumes_read() {
        let reqs = canonicalize(vec![
            LockRequest::dir_read(id("D1")),
            LockRequest::dir_write(id("D1")),
            LockRequest::dir_read(id("D1")),
            LockRequest::dir_read(id("D2")),
        ]);
        assert_eq!(
            reqs,
            vec![LockRequest::dir_write(id("D1")), LockRequest::dir_read(id("D2"))]
        );
    }

    #[test]
    fn test_hash_dir_bucket_is_stable() {
        let e = id("6A3F-55E0A1B2-1");
        assert_eq!(hash_dir_bucket(&e), hash_dir_bucket(&e.clone()));
        assert!(hash_dir_bucket(&e) < HASH_DIR_BUCKETS);
    }

    #[tokio::test]
    async fn test_opposite_order_requests_do_not_deadlock() {
        let locks = Arc::new(LockManager::new());

        let mut handles = Vec::new();
        for i in 0..32 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                let (first, second) = if i % 2 == 0 { ("A", "B") } else { ("B", "A") };
                let reqs = vec![
                    LockRequest::dir_write(id(first)),
                    LockRequest::dir_write(id(second)),
                ];
                let set = locks.lock_all(reqs, Duration::from_secs(10)).await.unwrap();
                assert_eq!(set.len(), 2);
                tokio::task::yield_now().await;
            }));
        }

        let all = futures::future::join_all(handles);
        let results = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("lock acquisition deadlocked");
        for result in results {
            result.unwrap();
        }
        assert_eq!(locks.entries().dirs.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_failed_acquisition_releases_partial_set() {
        let locks = LockManager::new();
        let blocker = locks
            .chunks()
            .lock(TargetId(1), "c/1", Duration::from_secs(1))
            .await
            .unwrap();

        let err = locks
            .lock_all(
                vec![
                    LockRequest::FileId(id("F")),
                    LockRequest::chunk(TargetId(1), "c/1"),
                ],
                Duration::from_millis(30),
            )
            .await
            .unwrap_err();
        assert_eq!(err, LockError::Timeout("chunk"));

        // The file lock taken before the chunk lock was released again
        let file = locks
            .lock_all(vec![LockRequest::FileId(id("F"))], Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(file.len(), 1);
        drop(blocker);
        assert_eq!(locks.chunks().active(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_in_flight_requests() {
        let locks = LockManager::new();
        locks.shutdown();
        let err = locks
            .lock_all(vec![LockRequest::HashDir(1)], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, LockError::Unavailable("hash-dir"));
    }
}
