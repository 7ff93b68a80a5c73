//! Replicated operations
//!
//! [`Operation`] is the closed set of request kinds a target executes. Each
//! payload type implements [`MirroredOp`], which tells the engine which locks
//! the operation needs, whether it changes observable state (and therefore
//! has to be forwarded), and how to execute it against local state.

use bytes::Bytes;
use mirrorfs_common::{ConsistencyState, EntryId, Error, Result, TargetId};
use mirrorfs_lock::LockRequest;
use mirrorfs_store::{ChunkStore, Dentry, Inode, MetaStore, NewEntryAttrs, SetAttrs};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Which replica an operation executes on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    /// Generates side effects (entry IDs, timestamps)
    Primary,
    /// Replays the side effects the primary generated
    Secondary,
}

/// Side effects generated by the primary and replayed by the secondary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub now: i64,
    pub new_id: Option<EntryId>,
}

impl Stamp {
    fn generate(with_id: bool) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        Self {
            now,
            new_id: with_id.then(EntryId::generate),
        }
    }
}

fn stamp_for(stamp: &mut Option<Stamp>, mode: ExecMode, with_id: bool, op: &str) -> Result<()> {
    match mode {
        ExecMode::Primary => {
            *stamp = Some(Stamp::generate(with_id));
            Ok(())
        }
        ExecMode::Secondary => match stamp {
            Some(s) if !with_id || s.new_id.is_some() => Ok(()),
            _ => Err(Error::invalid_argument(format!(
                "{op} forwarded without the primary's stamp"
            ))),
        },
    }
}

fn stamped<'a>(stamp: &'a Option<Stamp>, op: &str) -> Result<&'a Stamp> {
    stamp
        .as_ref()
        .ok_or_else(|| Error::internal(format!("{op} executed before it was stamped")))
}

fn stamped_id<'a>(stamp: &'a Option<Stamp>, op: &str) -> Result<&'a EntryId> {
    stamped(stamp, op)?
        .new_id
        .as_ref()
        .ok_or_else(|| Error::internal(format!("{op} executed without an entry ID")))
}

/// ID behind `parent/name`, `None` if there is no such entry
fn lookup_id(data: &TargetData, parent: &EntryId, name: &str) -> Result<Option<EntryId>> {
    match data.meta()?.lookup(parent, name) {
        Ok(dentry) => Ok(Some(dentry.id)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Local state of a target
#[derive(Clone, Debug)]
pub enum TargetData {
    Meta(Arc<MetaStore>),
    Chunks(Arc<ChunkStore>),
}

impl TargetData {
    pub fn meta(&self) -> Result<&MetaStore> {
        match self {
            Self::Meta(store) => Ok(store),
            Self::Chunks(_) => Err(Error::invalid_argument(
                "metadata operation sent to a storage target",
            )),
        }
    }

    pub fn chunks(&self) -> Result<&ChunkStore> {
        match self {
            Self::Chunks(store) => Ok(store),
            Self::Meta(_) => Err(Error::invalid_argument(
                "chunk operation sent to a metadata target",
            )),
        }
    }
}

/// Everything an operation may touch while executing
pub struct ExecContext<'a> {
    pub target: TargetId,
    pub mode: ExecMode,
    pub data: &'a TargetData,
}

/// Result of a successful operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpReply {
    Done,
    Entry(Inode),
    Entries(Vec<Dentry>),
    Removed(EntryId),
    Written { size: u64 },
    Data(Bytes),
}

/// Behaviour shared by every operation kind
pub trait MirroredOp {
    /// Locks to hold while executing (and forwarding), in any order
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest>;

    /// Whether a successful execution must be replayed on the secondary
    fn changes_observable_state(&self) -> bool;

    /// Generate (primary) or check (secondary) side effects before locking
    fn prepare(&mut self, _mode: ExecMode) -> Result<()> {
        Ok(())
    }

    /// Look up the entries a name refers to so that their locks are taken too.
    ///
    /// Runs on the primary before locking; [`MirroredOp::entries_current`]
    /// confirms the result once the locks are held.
    fn resolve_entries(&mut self, _data: &TargetData) -> Result<()> {
        Ok(())
    }

    /// Whether the entries found by [`MirroredOp::resolve_entries`] still match
    fn entries_current(&self, _data: &TargetData) -> bool {
        true
    }

    /// Apply the operation to local state
    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply>;

    /// Chunk paths a mutation touches, for resync bookkeeping
    fn touched_chunks(&self) -> Vec<String> {
        Vec::new()
    }
}

// ---- metadata operations ----

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkDirOp {
    pub parent: EntryId,
    pub name: String,
    pub attrs: NewEntryAttrs,
    pub stamp: Option<Stamp>,
}

impl MirroredOp for MkDirOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        let mut locks = vec![
            LockRequest::dir_write(self.parent.clone()),
            LockRequest::parent_name(self.parent.clone(), &self.name),
        ];
        if let Some(id) = self.stamp.as_ref().and_then(|s| s.new_id.as_ref()) {
            locks.push(LockRequest::hash_dir_of(id));
        }
        locks
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        stamp_for(&mut self.stamp, mode, true, "mkdir")
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let id = stamped_id(&self.stamp, "mkdir")?;
        let now = stamped(&self.stamp, "mkdir")?.now;
        let inode = ctx
            .data
            .meta()?
            .mkdir(&self.parent, &self.name, id, self.attrs, now)?;
        Ok(OpReply::Entry(inode))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkFileOp {
    pub parent: EntryId,
    pub name: String,
    pub attrs: NewEntryAttrs,
    pub stamp: Option<Stamp>,
}

impl MirroredOp for MkFileOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        let mut locks = vec![
            LockRequest::dir_write(self.parent.clone()),
            LockRequest::parent_name(self.parent.clone(), &self.name),
        ];
        if let Some(id) = self.stamp.as_ref().and_then(|s| s.new_id.as_ref()) {
            locks.push(LockRequest::hash_dir_of(id));
            locks.push(LockRequest::FileId(id.clone()));
        }
        locks
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        stamp_for(&mut self.stamp, mode, true, "mkfile")
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let id = stamped_id(&self.stamp, "mkfile")?;
        let now = stamped(&self.stamp, "mkfile")?.now;
        let inode = ctx
            .data
            .meta()?
            .mkfile(&self.parent, &self.name, id, self.attrs, now)?;
        Ok(OpReply::Entry(inode))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkOp {
    pub parent: EntryId,
    pub name: String,
    /// Inode the name referred to when the primary took its locks
    #[serde(default)]
    pub id: Option<EntryId>,
    pub stamp: Option<Stamp>,
}

impl MirroredOp for UnlinkOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        let mut locks = vec![
            LockRequest::dir_write(self.parent.clone()),
            LockRequest::parent_name(self.parent.clone(), &self.name),
        ];
        if let Some(id) = &self.id {
            locks.push(LockRequest::FileId(id.clone()));
        }
        locks
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        stamp_for(&mut self.stamp, mode, false, "unlink")
    }

    fn resolve_entries(&mut self, data: &TargetData) -> Result<()> {
        self.id = lookup_id(data, &self.parent, &self.name)?;
        Ok(())
    }

    fn entries_current(&self, data: &TargetData) -> bool {
        lookup_id(data, &self.parent, &self.name).is_ok_and(|id| id == self.id)
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let now = stamped(&self.stamp, "unlink")?.now;
        let id = ctx.data.meta()?.unlink(&self.parent, &self.name, now)?;
        Ok(OpReply::Removed(id))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmDirOp {
    pub parent: EntryId,
    pub name: String,
    /// ID the caller looked up; the directory is only removed if it still matches
    pub id: EntryId,
    pub stamp: Option<Stamp>,
}

impl MirroredOp for RmDirOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        vec![
            LockRequest::hash_dir_of(&self.id),
            LockRequest::dir_write(self.parent.clone()),
            LockRequest::dir_write(self.id.clone()),
            LockRequest::parent_name(self.parent.clone(), &self.name),
        ]
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        stamp_for(&mut self.stamp, mode, false, "rmdir")
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let now = stamped(&self.stamp, "rmdir")?.now;
        ctx.data
            .meta()?
            .rmdir(&self.parent, &self.name, &self.id, now)?;
        Ok(OpReply::Removed(self.id.clone()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameOp {
    pub from_parent: EntryId,
    pub from_name: String,
    pub to_parent: EntryId,
    pub to_name: String,
    pub stamp: Option<Stamp>,
}

impl MirroredOp for RenameOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        vec![
            LockRequest::dir_write(self.from_parent.clone()),
            LockRequest::dir_write(self.to_parent.clone()),
            LockRequest::parent_name(self.from_parent.clone(), &self.from_name),
            LockRequest::parent_name(self.to_parent.clone(), &self.to_name),
        ]
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        stamp_for(&mut self.stamp, mode, false, "rename")
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let now = stamped(&self.stamp, "rename")?.now;
        ctx.data.meta()?.rename(
            &self.from_parent,
            &self.from_name,
            &self.to_parent,
            &self.to_name,
            now,
        )?;
        Ok(OpReply::Done)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardLinkOp {
    pub from_parent: EntryId,
    pub from_name: String,
    pub to_parent: EntryId,
    pub to_name: String,
    /// Inode of the link source when the primary took its locks
    #[serde(default)]
    pub source: Option<EntryId>,
    pub stamp: Option<Stamp>,
}

impl MirroredOp for HardLinkOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        let mut locks = vec![
            LockRequest::dir_read(self.from_parent.clone()),
            LockRequest::dir_write(self.to_parent.clone()),
            LockRequest::parent_name(self.from_parent.clone(), &self.from_name),
            LockRequest::parent_name(self.to_parent.clone(), &self.to_name),
        ];
        if let Some(id) = &self.source {
            locks.push(LockRequest::FileId(id.clone()));
        }
        locks
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        stamp_for(&mut self.stamp, mode, false, "hardlink")
    }

    fn resolve_entries(&mut self, data: &TargetData) -> Result<()> {
        self.source = lookup_id(data, &self.from_parent, &self.from_name)?;
        Ok(())
    }

    fn entries_current(&self, data: &TargetData) -> bool {
        lookup_id(data, &self.from_parent, &self.from_name).is_ok_and(|id| id == self.source)
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let now = stamped(&self.stamp, "hardlink")?.now;
        let id = ctx.data.meta()?.hardlink(
            &self.from_parent,
            &self.from_name,
            &self.to_parent,
            &self.to_name,
            now,
        )?;
        Ok(OpReply::Entry(ctx.data.meta()?.stat(&id)?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttrOp {
    pub id: EntryId,
    pub attrs: SetAttrs,
    pub stamp: Option<Stamp>,
}

impl MirroredOp for SetAttrOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::FileId(self.id.clone())]
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        stamp_for(&mut self.stamp, mode, false, "setattr")
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let now = stamped(&self.stamp, "setattr")?.now;
        let inode = ctx.data.meta()?.set_attr(&self.id, self.attrs, now)?;
        Ok(OpReply::Entry(inode))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatOp {
    pub id: EntryId,
}

impl MirroredOp for StatOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        Vec::new()
    }

    fn changes_observable_state(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        Ok(OpReply::Entry(ctx.data.meta()?.stat(&self.id)?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDirOp {
    pub id: EntryId,
}

impl MirroredOp for ListDirOp {
    fn required_locks(&self, _local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::dir_read(self.id.clone())]
    }

    fn changes_observable_state(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        Ok(OpReply::Entries(ctx.data.meta()?.list_dir(&self.id)?))
    }
}

// ---- chunk operations ----

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteChunkOp {
    pub path: String,
    pub offset: u64,
    pub data: Bytes,
}

impl MirroredOp for WriteChunkOp {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::chunk(local, &self.path)]
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let size = ctx
            .data
            .chunks()?
            .write(&self.path, self.offset, &self.data)?;
        Ok(OpReply::Written { size })
    }

    fn touched_chunks(&self) -> Vec<String> {
        vec![self.path.clone()]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateChunkOp {
    pub path: String,
    pub len: u64,
}

impl MirroredOp for TruncateChunkOp {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::chunk(local, &self.path)]
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        ctx.data.chunks()?.truncate(&self.path, self.len)?;
        Ok(OpReply::Written { size: self.len })
    }

    fn touched_chunks(&self) -> Vec<String> {
        vec![self.path.clone()]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkChunkOp {
    pub path: String,
}

impl MirroredOp for UnlinkChunkOp {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::chunk(local, &self.path)]
    }

    fn changes_observable_state(&self) -> bool {
        true
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        ctx.data.chunks()?.unlink(&self.path)?;
        Ok(OpReply::Done)
    }

    fn touched_chunks(&self) -> Vec<String> {
        vec![self.path.clone()]
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadChunkOp {
    pub path: String,
    pub offset: u64,
    pub len: u32,
}

impl MirroredOp for ReadChunkOp {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::chunk(local, &self.path)]
    }

    fn changes_observable_state(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        let data = ctx
            .data
            .chunks()?
            .read(&self.path, self.offset, self.len as usize)?;
        Ok(OpReply::Data(data))
    }
}

// ---- resync operations (primary -> secondary only) ----

/// Full contents of a chunk pushed by a resync pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncChunkOp {
    pub path: String,
    pub data: Bytes,
}

impl MirroredOp for ResyncChunkOp {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::chunk(local, &self.path)]
    }

    fn changes_observable_state(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        ctx.data.chunks()?.replace(&self.path, &self.data)?;
        Ok(OpReply::Written {
            size: self.data.len() as u64,
        })
    }
}

/// A chunk or chunk directory that no longer exists on the primary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRemoveOp {
    pub path: String,
}

impl MirroredOp for ResyncRemoveOp {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::chunk(local, &self.path)]
    }

    fn changes_observable_state(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        ctx.data.chunks()?.remove_any(&self.path)?;
        Ok(OpReply::Done)
    }
}

/// A chunk directory with the names it contains on the primary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncDirOp {
    pub path: String,
    pub children: Vec<String>,
}

impl MirroredOp for ResyncDirOp {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        vec![LockRequest::chunk(local, &self.path)]
    }

    fn changes_observable_state(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        ctx.data.chunks()?.prune_dir(&self.path, &self.children)?;
        Ok(OpReply::Done)
    }
}

/// A primary's view of its secondary's consistency.
///
/// Reports carry an increasing version; a secondary ignores reports older
/// than the newest one it applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyStateOp {
    pub consistency: ConsistencyState,
    pub version: u64,
    /// Registry the report was taken from
    pub registry: u64,
}

/// Every request kind a target understands
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    MkDir(MkDirOp),
    MkFile(MkFileOp),
    Unlink(UnlinkOp),
    RmDir(RmDirOp),
    Rename(RenameOp),
    HardLink(HardLinkOp),
    SetAttr(SetAttrOp),
    Stat(StatOp),
    ListDir(ListDirOp),
    WriteChunk(WriteChunkOp),
    TruncateChunk(TruncateChunkOp),
    UnlinkChunk(UnlinkChunkOp),
    ReadChunk(ReadChunkOp),
    /// Liveness check between buddies
    Ping,
    /// Sent by a primary before it starts pushing a resync pass
    ResyncStarted,
    ResyncChunk(ResyncChunkOp),
    ResyncRemove(ResyncRemoveOp),
    ResyncDir(ResyncDirOp),
    /// Sent by a primary to align its secondary's view of its own state
    SetBuddyState(BuddyStateOp),
}

macro_rules! dispatch {
    ($self:expr, $op:ident => $body:expr, $ping:expr) => {
        match $self {
            Operation::MkDir($op) => $body,
            Operation::MkFile($op) => $body,
            Operation::Unlink($op) => $body,
            Operation::RmDir($op) => $body,
            Operation::Rename($op) => $body,
            Operation::HardLink($op) => $body,
            Operation::SetAttr($op) => $body,
            Operation::Stat($op) => $body,
            Operation::ListDir($op) => $body,
            Operation::WriteChunk($op) => $body,
            Operation::TruncateChunk($op) => $body,
            Operation::UnlinkChunk($op) => $body,
            Operation::ReadChunk($op) => $body,
            Operation::ResyncChunk($op) => $body,
            Operation::ResyncRemove($op) => $body,
            Operation::ResyncDir($op) => $body,
            Operation::Ping | Operation::ResyncStarted | Operation::SetBuddyState(_) => $ping,
        }
    };
}

impl Operation {
    /// Short name for logs and metrics
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MkDir(_) => "mkdir",
            Self::MkFile(_) => "mkfile",
            Self::Unlink(_) => "unlink",
            Self::RmDir(_) => "rmdir",
            Self::Rename(_) => "rename",
            Self::HardLink(_) => "hardlink",
            Self::SetAttr(_) => "setattr",
            Self::Stat(_) => "stat",
            Self::ListDir(_) => "listdir",
            Self::WriteChunk(_) => "write_chunk",
            Self::TruncateChunk(_) => "truncate_chunk",
            Self::UnlinkChunk(_) => "unlink_chunk",
            Self::ReadChunk(_) => "read_chunk",
            Self::Ping => "ping",
            Self::ResyncStarted => "resync_started",
            Self::ResyncChunk(_) => "resync_chunk",
            Self::ResyncRemove(_) => "resync_remove",
            Self::ResyncDir(_) => "resync_dir",
            Self::SetBuddyState(_) => "set_buddy_state",
        }
    }

    /// Resync traffic is only ever sent by a primary to its secondary
    #[must_use]
    pub const fn is_resync(&self) -> bool {
        matches!(
            self,
            Self::ResyncStarted | Self::ResyncChunk(_) | Self::ResyncRemove(_) | Self::ResyncDir(_)
        )
    }

    /// Requests only a group's primary sends, and only to its secondary
    #[must_use]
    pub const fn from_primary(&self) -> bool {
        self.is_resync() || matches!(self, Self::SetBuddyState(_))
    }
}

impl MirroredOp for Operation {
    fn required_locks(&self, local: TargetId) -> Vec<LockRequest> {
        dispatch!(self, op => op.required_locks(local), Vec::new())
    }

    fn changes_observable_state(&self) -> bool {
        dispatch!(self, op => op.changes_observable_state(), false)
    }

    fn prepare(&mut self, mode: ExecMode) -> Result<()> {
        dispatch!(self, op => op.prepare(mode), Ok(()))
    }

    fn execute(&self, ctx: &ExecContext<'_>) -> Result<OpReply> {
        dispatch!(self, op => op.execute(ctx), Ok(OpReply::Done))
    }

    fn touched_chunks(&self) -> Vec<String> {
        dispatch!(self, op => op.touched_chunks(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkdir(name: &str) -> Operation {
        Operation::MkDir(MkDirOp {
            parent: EntryId::root(),
            name: name.to_string(),
            attrs: NewEntryAttrs {
                mode: 0o755,
                uid: 0,
                gid: 0,
            },
            stamp: None,
        })
    }

    #[test]
    fn test_primary_stamps_and_secondary_requires_stamp() {
        let mut op = mkdir("a");
        assert!(op.clone().prepare(ExecMode::Secondary).is_err());

        op.prepare(ExecMode::Primary).unwrap();
        let Operation::MkDir(inner) = &op else {
            unreachable!()
        };
        let stamp = inner.stamp.clone().unwrap();
        assert!(stamp.new_id.is_some());

        // The secondary keeps the primary's values
        let mut forwarded = op.clone();
        forwarded.prepare(ExecMode::Secondary).unwrap();
        assert_eq!(forwarded, op);
    }

    #[test]
    fn test_replay_produces_identical_entries() {
        let primary = TargetData::Meta(Arc::new(MetaStore::new()));
        let secondary = TargetData::Meta(Arc::new(MetaStore::new()));

        let mut op = mkdir("docs");
        op.prepare(ExecMode::Primary).unwrap();
        let a = op
            .execute(&ExecContext {
                target: TargetId(1),
                mode: ExecMode::Primary,
                data: &primary,
            })
            .unwrap();
        let b = op
            .execute(&ExecContext {
                target: TargetId(2),
                mode: ExecMode::Secondary,
                data: &secondary,
            })
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_observable_state_flags() {
        assert!(mkdir("x").changes_observable_state());
        assert!(!Operation::Stat(StatOp { id: EntryId::root() }).changes_observable_state());
        assert!(!Operation::Ping.changes_observable_state());
        assert!(!Operation::ResyncChunk(ResyncChunkOp {
            path: "c".into(),
            data: Bytes::new(),
        })
        .changes_observable_state());
        assert!(Operation::ResyncStarted.is_resync());
    }

    #[test]
    fn test_unlink_and_hardlink_lock_the_inode() {
        let data = TargetData::Meta(Arc::new(MetaStore::new()));
        let id = EntryId::new("F1");
        data.meta()
            .unwrap()
            .mkfile(
                &EntryId::root(),
                "f",
                &id,
                NewEntryAttrs {
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                },
                1,
            )
            .unwrap();

        let mut unlink = Operation::Unlink(UnlinkOp {
            parent: EntryId::root(),
            name: "f".into(),
            id: None,
            stamp: None,
        });
        assert!(!unlink
            .required_locks(TargetId(1))
            .contains(&LockRequest::FileId(id.clone())));
        unlink.resolve_entries(&data).unwrap();
        assert!(unlink
            .required_locks(TargetId(1))
            .contains(&LockRequest::FileId(id.clone())));
        assert!(unlink.entries_current(&data));

        let mut link = Operation::HardLink(HardLinkOp {
            from_parent: EntryId::root(),
            from_name: "f".into(),
            to_parent: EntryId::root(),
            to_name: "g".into(),
            source: None,
            stamp: None,
        });
        link.resolve_entries(&data).unwrap();
        assert!(link
            .required_locks(TargetId(1))
            .contains(&LockRequest::FileId(id.clone())));

        // The name moved on after the lookup
        data.meta().unwrap().unlink(&EntryId::root(), "f", 2).unwrap();
        assert!(!unlink.entries_current(&data));
        assert!(!link.entries_current(&data));

        // A missing name resolves to no inode lock
        unlink.resolve_entries(&data).unwrap();
        assert!(unlink.entries_current(&data));
        assert_eq!(unlink.required_locks(TargetId(1)).len(), 2);
    }

    #[test]
    fn test_chunk_ops_lock_their_chunk() {
        let op = Operation::WriteChunk(WriteChunkOp {
            path: "a/c1".into(),
            offset: 0,
            data: Bytes::from_static(b"x"),
        });
        assert_eq!(
            op.required_locks(TargetId(3)),
            vec![LockRequest::chunk(TargetId(3), "a/c1")]
        );
        assert_eq!(op.touched_chunks(), vec!["a/c1".to_string()]);

        let meta = TargetData::Meta(Arc::new(MetaStore::new()));
        let err = op
            .execute(&ExecContext {
                target: TargetId(3),
                mode: ExecMode::Primary,
                data: &meta,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
