//! Chunk file store
//!
//! Every mirrored chunk is a plain file below `<target root>/buddymir`. Chunk
//! paths are relative to that directory and may contain subdirectories.

use bytes::Bytes;
use mirrorfs_common::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Name of the subdirectory holding mirrored chunks
pub const MIRROR_SUBDIR: &str = "buddymir";

/// I/O counters of a chunk store
#[derive(Debug, Default)]
pub struct ChunkStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub removals: AtomicU64,
}

/// A directory entry below the mirror root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
    stats: ChunkStats,
}

impl ChunkStore {
    /// Open (and create if needed) the mirror directory below `target_root`
    pub fn open(target_root: impl AsRef<Path>) -> Result<Self> {
        let root = target_root.as_ref().join(MIRROR_SUBDIR);
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            stats: ChunkStats::default(),
        })
    }

    /// Directory all chunk paths are relative to
    #[must_use]
    pub fn mirror_root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn stats(&self) -> &ChunkStats {
        &self.stats
    }

    /// Map a relative chunk path to its file, rejecting anything that escapes the root
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let valid = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(Error::invalid_argument(format!("invalid chunk path: {path:?}")));
        }
        Ok(self.root.join(rel))
    }

    /// Write `data` at `offset`, creating the chunk and its directories as needed.
    ///
    /// Returns the chunk size after the write.
    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u64> {
        let file_path = self.resolve(path)?;
        create_parent(&file_path)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&file_path)?;
        file.write_all_at(data, offset)?;

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(file.metadata()?.len())
    }

    /// Read up to `len` bytes at `offset`; reading past the end returns fewer bytes
    pub fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        let file_path = self.resolve(path)?;
        let file = open_existing(&file_path, path)?;

        let size = file.metadata()?.len();
        let available = usize::try_from(size.saturating_sub(offset)).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; len.min(available)];
        file.read_exact_at(&mut buf, offset)?;

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(Bytes::from(buf))
    }

    /// Whole contents of a chunk
    pub fn read_all(&self, path: &str) -> Result<Bytes> {
        let file_path = self.resolve(path)?;
        match fs::read(&file_path) {
            Ok(data) => {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_read
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Set the chunk length, creating an empty chunk if it does not exist
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let file_path = self.resolve(path)?;
        create_parent(&file_path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&file_path)?;
        file.set_len(len)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Delete a chunk file
    pub fn unlink(&self, path: &str) -> Result<()> {
        let file_path = self.resolve(path)?;
        match fs::remove_file(&file_path) {
            Ok(()) => {
                self.stats.removals.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a chunk's contents as a whole (write to a temp file, then rename)
    pub fn replace(&self, path: &str, data: &[u8]) -> Result<()> {
        let file_path = self.resolve(path)?;
        create_parent(&file_path)?;

        let mut temp_name = file_path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".resync-tmp");
        let temp_path = file_path.with_file_name(temp_name);
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &file_path)?;

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Remove a chunk or a whole chunk directory; a missing path is not an error
    pub fn remove_any(&self, path: &str) -> Result<bool> {
        let file_path = self.resolve(path)?;
        let meta = match fs::symlink_metadata(&file_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            fs::remove_dir_all(&file_path)?;
        } else {
            fs::remove_file(&file_path)?;
        }
        self.stats.removals.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Make sure a chunk directory exists
    pub fn ensure_dir(&self, path: &str) -> Result<()> {
        let dir = self.resolve(path)?;
        fs::create_dir_all(dir)?;
        Ok(())
    }

    /// Entries of a chunk directory, sorted by name
    pub fn list_dir(&self, path: &str) -> Result<Vec<ChunkDirEntry>> {
        let dir = self.resolve(path)?;
        let mut entries = Vec::new();
        let iter = match fs::read_dir(&dir) {
            Ok(iter) => iter,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(path)),
            Err(e) => return Err(e.into()),
        };
        for entry in iter {
            let entry = entry?;
            entries.push(ChunkDirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Remove every child of a directory whose name is not in `keep`.
    ///
    /// Creates the directory if it is missing. Returns the number of removed entries.
    pub fn prune_dir(&self, path: &str, keep: &[String]) -> Result<usize> {
        self.ensure_dir(path)?;
        let mut removed = 0;
        for entry in self.list_dir(path)? {
            if keep.iter().any(|k| *k == entry.name) {
                continue;
            }
            let child = format!("{path}/{}", entry.name);
            if self.remove_any(&child)? {
                debug!(path = %child, "Pruned stale chunk entry");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn create_parent(file_path: &Path) -> Result<()> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn open_existing(file_path: &Path, path: &str) -> Result<File> {
    File::open(file_path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            Error::not_found(path)
        } else {
            e.into()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();

        assert_eq!(store.write("a/b/c1", 0, b"hello").unwrap(), 5);
        assert_eq!(store.write("a/b/c1", 10, b"x").unwrap(), 11);
        assert_eq!(&store.read("a/b/c1", 0, 5).unwrap()[..], b"hello");
        assert_eq!(store.read("a/b/c1", 9, 100).unwrap().len(), 2);
        assert!(store.read("a/b/c1", 50, 10).unwrap().is_empty());

        store.truncate("a/b/c1", 3).unwrap();
        assert_eq!(&store.read_all("a/b/c1").unwrap()[..], b"hel");

        store.unlink("a/b/c1").unwrap();
        assert!(store.unlink("a/b/c1").unwrap_err().is_not_found());
        assert!(store.read_all("a/b/c1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        assert!(store.resolve("../outside").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
        assert!(store.resolve("ok/chunk").is_ok());
    }

    #[test]
    fn test_prune_dir_keeps_listed_children() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(dir.path()).unwrap();
        store.write("d/keep", 0, b"1").unwrap();
        store.write("d/stale", 0, b"2").unwrap();
        store.write("d/old/nested", 0, b"3").unwrap();

        let removed = store.prune_dir("d", &["keep".to_string()]).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            store.list_dir("d").unwrap(),
            vec![ChunkDirEntry {
                name: "keep".into(),
                is_dir: false
            }]
        );

        store.replace("d/keep", b"new").unwrap();
        assert_eq!(&store.read_all("d/keep").unwrap()[..], b"new");
        assert!(!store.remove_any("missing").unwrap());
    }
}
