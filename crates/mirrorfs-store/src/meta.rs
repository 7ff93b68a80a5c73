//! In-memory metadata store
//!
//! Holds the inodes and dentries of one metadata target. Entry IDs and
//! timestamps are always supplied by the caller: the primary generates them,
//! the secondary replays the primary's values, so both replicas end up with
//! identical entries.

use mirrorfs_common::{EntryId, EntryKind, Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An inode: attributes of a file or directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub id: EntryId,
    pub kind: EntryKind,
    /// Parent directory (directories only; files may have several names)
    pub parent: Option<EntryId>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// A name in a directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    pub name: String,
    pub id: EntryId,
    pub kind: EntryKind,
}

/// Attributes of a new entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntryAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Attribute changes; `None` leaves a field untouched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

#[derive(Debug)]
struct MetaState {
    inodes: HashMap<EntryId, Inode>,
    dirs: HashMap<EntryId, BTreeMap<String, Dentry>>,
}

impl MetaState {
    fn dir(&self, id: &EntryId) -> Result<&BTreeMap<String, Dentry>> {
        match self.dirs.get(id) {
            Some(dir) => Ok(dir),
            None if self.inodes.contains_key(id) => Err(Error::NotADirectory(id.to_string())),
            None => Err(Error::not_found(id.to_string())),
        }
    }

    fn dir_mut(&mut self, id: &EntryId) -> Result<&mut BTreeMap<String, Dentry>> {
        if !self.dirs.contains_key(id) {
            return Err(if self.inodes.contains_key(id) {
                Error::NotADirectory(id.to_string())
            } else {
                Error::not_found(id.to_string())
            });
        }
        self.dirs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    fn lookup(&self, parent: &EntryId, name: &str) -> Result<Dentry> {
        self.dir(parent)?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("{parent}/{name}")))
    }

    fn touch_dir(&mut self, id: &EntryId, now: i64) {
        if let Some(inode) = self.inodes.get_mut(id) {
            inode.mtime = now;
            inode.ctime = now;
        }
    }

    /// Whether `ancestor` is `id` or one of its parents
    fn is_ancestor(&self, ancestor: &EntryId, id: &EntryId) -> bool {
        let mut current = Some(id.clone());
        while let Some(cur) = current {
            if cur == *ancestor {
                return true;
            }
            current = self.inodes.get(&cur).and_then(|i| i.parent.clone());
        }
        false
    }

    fn drop_link(&mut self, id: &EntryId, now: i64) {
        let remove = match self.inodes.get_mut(id) {
            Some(inode) => {
                inode.nlink = inode.nlink.saturating_sub(1);
                inode.ctime = now;
                inode.nlink == 0
            }
            None => false,
        };
        if remove {
            self.inodes.remove(id);
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::invalid_argument(format!("invalid entry name: {name:?}")));
    }
    Ok(())
}

#[derive(Debug)]
pub struct MetaStore {
    state: RwLock<MetaState>,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore {
    /// Create a store containing only the root directory
    #[must_use]
    pub fn new() -> Self {
        let root = EntryId::root();
        let mut inodes = HashMap::new();
        inodes.insert(
            root.clone(),
            Inode {
                id: root.clone(),
                kind: EntryKind::Directory,
                parent: None,
                mode: 0o755,
                uid: 0,
                gid: 0,
                nlink: 2,
                atime: 0,
                mtime: 0,
                ctime: 0,
            },
        );
        let mut dirs = HashMap::new();
        dirs.insert(root, BTreeMap::new());

        Self {
            state: RwLock::new(MetaState { inodes, dirs }),
        }
    }

    fn create(
        &self,
        parent: &EntryId,
        name: &str,
        id: &EntryId,
        kind: EntryKind,
        attrs: NewEntryAttrs,
        now: i64,
    ) -> Result<Inode> {
        check_name(name)?;
        let mut state = self.state.write();
        let dir = state.dir_mut(parent)?;
        if dir.contains_key(name) {
            return Err(Error::AlreadyExists(format!("{parent}/{name}")));
        }
        dir.insert(
            name.to_string(),
            Dentry {
                name: name.to_string(),
                id: id.clone(),
                kind,
            },
        );

        let inode = Inode {
            id: id.clone(),
            kind,
            parent: (kind == EntryKind::Directory).then(|| parent.clone()),
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            nlink: if kind == EntryKind::Directory { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
        };
        state.inodes.insert(id.clone(), inode.clone());
        if kind == EntryKind::Directory {
            state.dirs.insert(id.clone(), BTreeMap::new());
        }
        state.touch_dir(parent, now);
        Ok(inode)
    }

    /// Create a directory `name` in `parent` with the given ID
    pub fn mkdir(
        &self,
        parent: &EntryId,
        name: &str,
        id: &EntryId,
        attrs: NewEntryAttrs,
        now: i64,
    ) -> Result<Inode> {
        self.create(parent, name, id, EntryKind::Directory, attrs, now)
    }

    /// Create a regular file `name` in `parent` with the given ID
    pub fn mkfile(
        &self,
        parent: &EntryId,
        name: &str,
        id: &EntryId,
        attrs: NewEntryAttrs,
        now: i64,
    ) -> Result<Inode> {
        self.create(parent, name, id, EntryKind::File, attrs, now)
    }

    /// Remove a file name; the inode goes away with its last link
    pub fn unlink(&self, parent: &EntryId, name: &str, now: i64) -> Result<EntryId> {
        let mut state = self.state.write();
        let dentry = state.lookup(parent, name)?;
        if dentry.kind == EntryKind::Directory {
            return Err(Error::IsADirectory(format!("{parent}/{name}")));
        }
        state.dir_mut(parent)?.remove(name);
        state.drop_link(&dentry.id, now);
        state.touch_dir(parent, now);
        Ok(dentry.id)
    }

    /// Remove an empty directory; `expected` must match the dentry's ID
    pub fn rmdir(&self, parent: &EntryId, name: &str, expected: &EntryId, now: i64) -> Result<()> {
        let mut state = self.state.write();
        let dentry = state.lookup(parent, name)?;
        if dentry.id != *expected {
            return Err(Error::not_found(format!("{parent}/{name} ({expected})")));
        }
        if dentry.kind != EntryKind::Directory {
            return Err(Error::NotADirectory(format!("{parent}/{name}")));
        }
        if !state.dir(&dentry.id)?.is_empty() {
            return Err(Error::NotEmpty(format!("{parent}/{name}")));
        }
        state.dir_mut(parent)?.remove(name);
        state.dirs.remove(&dentry.id);
        state.inodes.remove(&dentry.id);
        state.touch_dir(parent, now);
        Ok(())
    }

    /// Move `from_parent/from_name` to `to_parent/to_name`.
    ///
    /// An existing file at the destination is replaced when the source is a
    /// file too; any other existing destination is an error.
    pub fn rename(
        &self,
        from_parent: &EntryId,
        from_name: &str,
        to_parent: &EntryId,
        to_name: &str,
        now: i64,
    ) -> Result<()> {
        check_name(to_name)?;
        let mut state = self.state.write();
        let source = state.lookup(from_parent, from_name)?;
        state.dir(to_parent)?;

        if from_parent == to_parent && from_name == to_name {
            return Ok(());
        }
        if source.kind == EntryKind::Directory && state.is_ancestor(&source.id, to_parent) {
            return Err(Error::invalid_argument(format!(
                "cannot move directory {} below itself",
                source.id
            )));
        }

        let replaced = match state.dir(to_parent)?.get(to_name) {
            Some(existing)
                if existing.kind == EntryKind::File && source.kind == EntryKind::File =>
            {
                Some(existing.id.clone())
            }
            Some(_) => return Err(Error::AlreadyExists(format!("{to_parent}/{to_name}"))),
            None => None,
        };

        state.dir_mut(from_parent)?.remove(from_name);
        state.dir_mut(to_parent)?.insert(
            to_name.to_string(),
            Dentry {
                name: to_name.to_string(),
                id: source.id.clone(),
                kind: source.kind,
            },
        );
        if let Some(old) = replaced
            && old != source.id
        {
            state.drop_link(&old, now);
        }
        if let Some(inode) = state.inodes.get_mut(&source.id) {
            if source.kind == EntryKind::Directory {
                inode.parent = Some(to_parent.clone());
            }
            inode.ctime = now;
        }
        state.touch_dir(from_parent, now);
        state.touch_dir(to_parent, now);
        Ok(())
    }

    /// Add a second name for an existing file
    pub fn hardlink(
        &self,
        from_parent: &EntryId,
        from_name: &str,
        to_parent: &EntryId,
        to_name: &str,
        now: i64,
    ) -> Result<EntryId> {
        check_name(to_name)?;
        let mut state = self.state.write();
        let source = state.lookup(from_parent, from_name)?;
        if source.kind == EntryKind::Directory {
            return Err(Error::IsADirectory(format!("{from_parent}/{from_name}")));
        }
        let dir = state.dir_mut(to_parent)?;
        if dir.contains_key(to_name) {
            return Err(Error::AlreadyExists(format!("{to_parent}/{to_name}")));
        }
        dir.insert(
            to_name.to_string(),
            Dentry {
                name: to_name.to_string(),
                id: source.id.clone(),
                kind: EntryKind::File,
            },
        );
        if let Some(inode) = state.inodes.get_mut(&source.id) {
            inode.nlink += 1;
            inode.ctime = now;
        }
        state.touch_dir(to_parent, now);
        Ok(source.id)
    }

    /// Change attributes of an entry
    pub fn set_attr(&self, id: &EntryId, attrs: SetAttrs, now: i64) -> Result<Inode> {
        let mut state = self.state.write();
        let inode = state
            .inodes
            .get_mut(id)
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        if let Some(mode) = attrs.mode {
            inode.mode = mode;
        }
        if let Some(uid) = attrs.uid {
            inode.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            inode.gid = gid;
        }
        if let Some(atime) = attrs.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = attrs.mtime {
            inode.mtime = mtime;
        }
        inode.ctime = now;
        Ok(inode.clone())
    }

    pub fn stat(&self, id: &EntryId) -> Result<Inode> {
        self.state
            .read()
            .inodes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    pub fn lookup(&self, parent: &EntryId, name: &str) -> Result<Dentry> {
        self.state.read().lookup(parent, name)
    }

    /// Entries of a directory, sorted by name
    pub fn list_dir(&self, id: &EntryId) -> Result<Vec<Dentry>> {
        Ok(self.state.read().dir(id)?.values().cloned().collect())
    }

    /// Number of inodes including the root
    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.state.read().inodes.len()
    }
}
