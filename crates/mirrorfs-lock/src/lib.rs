//! MirrorFS Lock - Scoped lock stores
//!
//! Process-local advisory locks used to serialize replicated operations on
//! the same logical object. Each resource domain (hash-dir buckets, directory
//! IDs, dentry names, file IDs, chunks) has its own table so unrelated
//! operations never contend.

pub mod entry;
pub mod store;

pub use entry::{
    ChunkKey, ChunkLockStore, EntryLockStore, HASH_DIR_BUCKETS, HeldLock, LockManager,
    LockRequest, LockSet, canonicalize, hash_dir_bucket,
};
pub use store::{LockError, LockMode, LockStore, LockToken};
