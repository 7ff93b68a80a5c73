//! MirrorFS Resync - Bringing a secondary back in sync
//!
//! A resync pass walks the primary's chunk tree for objects changed since the
//! last successful buddy communication, pushes them to the secondary, and
//! declares the secondary good once every change (including those made while
//! the pass ran) has been transferred.

pub mod candidate;
pub mod coordinator;
pub mod gather;
pub mod job;
pub mod pusher;
pub mod tree;

pub use candidate::{CandidateKind, CandidateQueue, ROOT_PATH, ResyncCandidate, child_path};
pub use coordinator::{ResyncCoordinator, StartOptions};
pub use gather::{GatherCounters, GatherSnapshot, Gatherer, resync_threshold};
pub use job::{JobState, JobStats, ResyncJob};
pub use pusher::{ChunkResyncer, PushOutcome};
pub use tree::{FsTree, NodeStat, TreeAccess};
