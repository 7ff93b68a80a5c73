//! Resync candidate gathering
//!
//! Walks a primary's chunk tree and queues every directory modified and
//! every chunk changed after the resync threshold. Directories are spread
//! over a pool of worker threads through a shared work queue; discovery
//! order is unspecified, but every match is queued exactly once.

use crate::candidate::{CandidateQueue, ROOT_PATH, ResyncCandidate, child_path};
use crate::tree::TreeAccess;
use crossbeam_channel::{Receiver, Sender};
use mirrorfs_common::{Error, Result, TargetId};
use mirrorfs_registry::BuddyComm;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Oldest change time (seconds since the epoch) a pass has to look at.
///
/// Zero means everything is a candidate: no buddy communication was ever
/// recorded, the caller asked to ignore the timestamp, or the safety
/// threshold is disabled and no override is set.
#[must_use]
pub fn resync_threshold(comm: &BuddyComm, safety: Duration, ignore_timestamp: bool) -> i64 {
    let (last_comm, is_override) = comm.effective();
    if ignore_timestamp || last_comm == 0 || (safety.is_zero() && !is_override) {
        return 0;
    }
    i64::try_from(last_comm.saturating_sub(safety.as_secs())).unwrap_or(i64::MAX)
}

/// Walk counters of one pass; reset when a pass starts
#[derive(Debug, Default)]
pub struct GatherCounters {
    pub discovered_files: AtomicU64,
    pub matched_files: AtomicU64,
    pub discovered_dirs: AtomicU64,
    pub matched_dirs: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GatherSnapshot {
    pub discovered_files: u64,
    pub matched_files: u64,
    pub discovered_dirs: u64,
    pub matched_dirs: u64,
}

impl GatherCounters {
    pub fn reset(&self) {
        self.discovered_files.store(0, Ordering::Relaxed);
        self.matched_files.store(0, Ordering::Relaxed);
        self.discovered_dirs.store(0, Ordering::Relaxed);
        self.matched_dirs.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> GatherSnapshot {
        GatherSnapshot {
            discovered_files: self.discovered_files.load(Ordering::Relaxed),
            matched_files: self.matched_files.load(Ordering::Relaxed),
            discovered_dirs: self.discovered_dirs.load(Ordering::Relaxed),
            matched_dirs: self.matched_dirs.load(Ordering::Relaxed),
        }
    }
}

enum Work {
    Dir(String),
    Done,
}

/// One walk over a target's chunk tree
pub struct Gatherer<'a> {
    pub tree: &'a dyn TreeAccess,
    pub target: TargetId,
    pub threshold: i64,
    pub queue: &'a CandidateQueue,
    pub counters: &'a GatherCounters,
    pub stop: &'a AtomicBool,
}

impl Gatherer<'_> {
    /// Walk the whole tree with `workers` threads; returns once all are done.
    ///
    /// Only a failure to stat the tree root fails the walk. Nodes that vanish
    /// or cannot be read while walking are skipped.
    pub fn run(&self, workers: usize) -> Result<()> {
        let root = self.tree.stat(ROOT_PATH).map_err(|e| {
            Error::ResyncRefused(format!("cannot stat chunk root of target {}: {e}", self.target))
        })?;
        if !root.is_dir {
            return Err(Error::ResyncRefused(format!(
                "chunk root of target {} is not a directory",
                self.target
            )));
        }
        self.counters.discovered_dirs.fetch_add(1, Ordering::Relaxed);
        if root.mtime > self.threshold {
            self.counters.matched_dirs.fetch_add(1, Ordering::Relaxed);
            self.queue.push(ResyncCandidate::dir(self.target, ROOT_PATH));
        }

        let workers = workers.max(1);
        let (tx, rx) = crossbeam_channel::unbounded();
        let pending = AtomicUsize::new(1);
        let _ = tx.send(Work::Dir(ROOT_PATH.to_string()));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let (tx, rx, pending) = (tx.clone(), rx.clone(), &pending);
                scope.spawn(move || self.worker(&tx, &rx, pending, workers));
            }
        });

        debug!(
            target_id = %self.target,
            threshold = self.threshold,
            "gather finished: {:?}",
            self.counters.snapshot()
        );
        Ok(())
    }

    fn worker(&self, tx: &Sender<Work>, rx: &Receiver<Work>, pending: &AtomicUsize, workers: usize) {
        while let Ok(Work::Dir(path)) = rx.recv() {
            if !self.stop.load(Ordering::Relaxed) {
                self.scan_dir(&path, tx, pending);
            }
            if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                for _ in 0..workers {
                    let _ = tx.send(Work::Done);
                }
            }
        }
    }

    fn scan_dir(&self, path: &str, tx: &Sender<Work>, pending: &AtomicUsize) {
        let names = match self.tree.list(path) {
            Ok(names) => names,
            Err(e) => {
                warn!(target_id = %self.target, %path, "cannot list directory: {}", e);
                return;
            }
        };

        for name in names {
            let child = child_path(path, &name);
            let stat = match self.tree.stat(&child) {
                Ok(stat) => stat,
                Err(e) => {
                    debug!(target_id = %self.target, path = %child, "skipping vanished entry: {}", e);
                    continue;
                }
            };

            if stat.is_dir {
                self.counters.discovered_dirs.fetch_add(1, Ordering::Relaxed);
                if stat.mtime > self.threshold {
                    self.counters.matched_dirs.fetch_add(1, Ordering::Relaxed);
                    self.queue.push(ResyncCandidate::dir(self.target, child.clone()));
                }
                pending.fetch_add(1, Ordering::AcqRel);
                let _ = tx.send(Work::Dir(child));
            } else {
                self.counters.discovered_files.fetch_add(1, Ordering::Relaxed);
                if stat.ctime > self.threshold {
                    self.counters.matched_files.fetch_add(1, Ordering::Relaxed);
                    self.queue.push(ResyncCandidate::chunk(self.target, child));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateKind;
    use crate::tree::{FsTree, NodeStat};
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::{BTreeMap, BTreeSet};
    use std::io;

    /// In-memory tree with chosen timestamps
    #[derive(Default)]
    struct MemTree {
        nodes: BTreeMap<String, (NodeStat, Vec<String>)>,
    }

    impl MemTree {
        fn add(&mut self, parent: Option<&str>, path: &str, is_dir: bool, time: i64) {
            let stat = NodeStat {
                is_dir,
                mtime: time,
                ctime: time,
            };
            self.nodes.insert(path.to_string(), (stat, Vec::new()));
            if let Some(parent) = parent {
                let name = path.rsplit('/').next().unwrap().to_string();
                self.nodes.get_mut(parent).unwrap().1.push(name);
            }
        }
    }

    impl TreeAccess for MemTree {
        fn stat(&self, path: &str) -> io::Result<NodeStat> {
            self.nodes
                .get(path)
                .map(|(s, _)| *s)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn list(&self, path: &str) -> io::Result<Vec<String>> {
            self.nodes
                .get(path)
                .map(|(_, c)| c.clone())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    /// Random tree plus the set of nodes newer than `threshold`
    fn random_tree(seed: u64, threshold: i64) -> (MemTree, BTreeSet<(String, bool)>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tree = MemTree::default();
        let mut expected = BTreeSet::new();
        let time = |rng: &mut StdRng| rng.gen_range(threshold - 50..threshold + 50);

        let t = time(&mut rng);
        tree.add(None, ROOT_PATH, true, t);
        if t > threshold {
            expected.insert((ROOT_PATH.to_string(), true));
        }

        let mut dirs = vec![(ROOT_PATH.to_string(), 0)];
        while let Some((dir, depth)) = dirs.pop() {
            for i in 0..rng.gen_range(1..6) {
                let is_dir = depth < 3 && rng.gen_bool(0.4);
                let path = child_path(&dir, &format!("{}{i}", if is_dir { "d" } else { "c" }));
                let t = time(&mut rng);
                tree.add(Some(&dir), &path, is_dir, t);
                if t > threshold {
                    expected.insert((path.clone(), is_dir));
                }
                if is_dir {
                    dirs.push((path, depth + 1));
                }
            }
        }
        (tree, expected)
    }

    async fn gather_all(tree: &MemTree, threshold: i64, workers: usize) -> BTreeSet<(String, bool)> {
        let queue = CandidateQueue::new();
        let counters = GatherCounters::default();
        let stop = AtomicBool::new(false);
        Gatherer {
            tree,
            target: TargetId(1),
            threshold,
            queue: &queue,
            counters: &counters,
            stop: &stop,
        }
        .run(workers)
        .unwrap();
        queue.close();

        let mut found = BTreeSet::new();
        while let Some(c) = queue.pop().await {
            assert!(found.insert((c.path, c.kind == CandidateKind::Dir)), "duplicate");
        }
        let snap = counters.snapshot();
        assert_eq!(
            snap.matched_files + snap.matched_dirs,
            found.len() as u64
        );
        found
    }

    #[tokio::test]
    async fn test_every_change_is_found_regardless_of_worker_count() {
        for seed in 0..8 {
            let (tree, expected) = random_tree(seed, 1_000);
            assert_eq!(gather_all(&tree, 1_000, 1).await, expected);
            assert_eq!(gather_all(&tree, 1_000, 8).await, expected);
        }
    }

    #[tokio::test]
    async fn test_zero_threshold_matches_everything_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("u1/sub")).unwrap();
        std::fs::write(dir.path().join("u1/c1"), b"a").unwrap();
        std::fs::write(dir.path().join("u1/sub/c2"), b"b").unwrap();
        std::fs::write(dir.path().join("c3"), b"c").unwrap();

        let tree = FsTree::new(dir.path());
        let queue = CandidateQueue::new();
        let counters = GatherCounters::default();
        let stop = AtomicBool::new(false);
        Gatherer {
            tree: &tree,
            target: TargetId(1),
            threshold: 0,
            queue: &queue,
            counters: &counters,
            stop: &stop,
        }
        .run(4)
        .unwrap();

        let snap = counters.snapshot();
        assert_eq!(snap.discovered_files, 3);
        assert_eq!(snap.matched_files, 3);
        assert_eq!(snap.discovered_dirs, 3);
        assert_eq!(snap.matched_dirs, 3);
        assert_eq!(queue.accepted(), 6);

        // A threshold in the future matches nothing
        let queue = CandidateQueue::new();
        counters.reset();
        Gatherer {
            tree: &tree,
            target: TargetId(1),
            threshold: i64::MAX,
            queue: &queue,
            counters: &counters,
            stop: &stop,
        }
        .run(4)
        .unwrap();
        assert_eq!(queue.accepted(), 0);
        assert_eq!(counters.snapshot().discovered_files, 3);
    }

    #[test]
    fn test_missing_root_fails_the_walk() {
        let tree = FsTree::new("/nonexistent/mirrorfs/root");
        let queue = CandidateQueue::new();
        let counters = GatherCounters::default();
        let stop = AtomicBool::new(false);
        let err = Gatherer {
            tree: &tree,
            target: TargetId(1),
            threshold: 0,
            queue: &queue,
            counters: &counters,
            stop: &stop,
        }
        .run(2)
        .unwrap_err();
        assert!(matches!(err, Error::ResyncRefused(_)));
    }

    #[test]
    fn test_threshold_rules() {
        let safety = Duration::from_secs(600);
        let comm = |last, over| BuddyComm {
            last_comm_secs: last,
            override_secs: over,
        };
        assert_eq!(resync_threshold(&comm(0, 0), safety, false), 0);
        assert_eq!(resync_threshold(&comm(10_000, 0), safety, false), 9_400);
        assert_eq!(resync_threshold(&comm(10_000, 0), safety, true), 0);
        assert_eq!(resync_threshold(&comm(10_000, 0), Duration::ZERO, false), 0);
        // An override wins, also without a safety threshold
        assert_eq!(resync_threshold(&comm(10_000, 5_000), safety, false), 4_400);
        assert_eq!(resync_threshold(&comm(10_000, 5_000), Duration::ZERO, false), 5_000);
        assert_eq!(resync_threshold(&comm(100, 0), safety, false), 0);
    }
}
