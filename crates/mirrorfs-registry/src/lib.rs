//! MirrorFS Registry - Buddy groups and target states
//!
//! This crate resolves buddy group IDs to their (primary, secondary) target
//! pair, tracks reachability and consistency of every target, and keeps a
//! persisted copy of both on stable storage.

pub mod mapper;
pub mod persist;
pub mod registry;
pub mod state;

pub use mapper::{BuddyGroup, BuddyGroupMapper};
pub use persist::{JsonStateFile, PersistHandle, RegistrySnapshot, StatePersistence, load_or_bootstrap};
pub use registry::Registry;
pub use state::{BuddyComm, StateCause, TargetRecord, TargetStateStore, unix_now};
