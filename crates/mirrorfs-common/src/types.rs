//! Core type definitions for MirrorFS
//!
//! This module defines the identifiers and state enums shared by every
//! component: entries, targets, buddy groups and the per-target
//! consistency/reachability states.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Numeric identifier of a target (a storage target or a metadata node)
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct TargetId(pub u16);

impl TargetId {
    /// Get the raw numeric value
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TargetId({})", self.0)
    }
}

/// Numeric identifier of a buddy (replication) group
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct GroupId(pub u16);

impl GroupId {
    /// Get the raw numeric value
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

/// Opaque identifier of a filesystem entry (file, directory or dentry)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct EntryId(String);

impl EntryId {
    /// ID of the filesystem root directory
    pub const ROOT: &'static str = "root";

    /// Wrap an existing ID
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The root directory ID
    #[must_use]
    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }

    /// Generate a fresh, globally unique ID
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().to_uppercase())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the ID as raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({:?})", self.0)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Kind of a filesystem object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum EntryKind {
    File,
    Directory,
}

/// What a target stores
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Metadata node (dentries and inodes)
    Meta,
    /// Storage target (file chunks)
    #[default]
    Storage,
}

/// Data consistency of a target relative to its buddy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyState {
    #[default]
    #[display("good")]
    Good,
    #[display("needs-resync")]
    NeedsResync,
    #[display("bad")]
    Bad,
}

/// Reachability of a target as seen by this node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityState {
    #[default]
    #[display("online")]
    Online,
    #[display("probably-offline")]
    ProbablyOffline,
    #[display("offline")]
    Offline,
}

/// Reachability and consistency of a target, tracked together
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{reachability}/{consistency}")]
pub struct CombinedTargetState {
    pub reachability: ReachabilityState,
    pub consistency: ConsistencyState,
}

impl CombinedTargetState {
    /// Create a combined state
    #[must_use]
    pub const fn new(reachability: ReachabilityState, consistency: ConsistencyState) -> Self {
        Self {
            reachability,
            consistency,
        }
    }

    /// Online and good: the only state in which a target may take live secondary traffic
    #[must_use]
    pub fn is_online_good(&self) -> bool {
        self.reachability == ReachabilityState::Online
            && self.consistency == ConsistencyState::Good
    }
}

/// Role of a target within its buddy group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MirrorRole {
    Primary,
    Secondary,
}
