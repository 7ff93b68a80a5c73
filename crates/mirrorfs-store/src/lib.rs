//! MirrorFS Store - Local replica state
//!
//! The state a replicated operation executes against: an in-memory metadata
//! store for metadata targets and a file-backed chunk store for storage
//! targets.

pub mod chunk;
pub mod meta;

pub use chunk::{ChunkDirEntry, ChunkStats, ChunkStore, MIRROR_SUBDIR};
pub use meta::{Dentry, Inode, MetaStore, NewEntryAttrs, SetAttrs};
