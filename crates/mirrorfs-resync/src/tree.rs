//! Read access to a target's chunk tree

use crate::candidate::ROOT_PATH;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Timestamps of one tree node, in seconds since the epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeStat {
    pub is_dir: bool,
    pub mtime: i64,
    /// Change time; unlike `mtime` it cannot be set by users
    pub ctime: i64,
}

/// A chunk tree that can be walked by the gatherer
pub trait TreeAccess: Send + Sync {
    /// Stat a node; `ROOT_PATH` is the tree root
    fn stat(&self, path: &str) -> io::Result<NodeStat>;

    /// Names of a directory's children
    fn list(&self, path: &str) -> io::Result<Vec<String>>;
}

/// The on-disk chunk tree below a mirror root
#[derive(Clone, Debug)]
pub struct FsTree {
    root: PathBuf,
}

impl FsTree {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path == ROOT_PATH {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

impl TreeAccess for FsTree {
    fn stat(&self, path: &str) -> io::Result<NodeStat> {
        let meta = std::fs::symlink_metadata(self.full_path(path))?;
        Ok(NodeStat {
            is_dir: meta.is_dir(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        })
    }

    fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.full_path(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}
