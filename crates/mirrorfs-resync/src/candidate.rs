//! Resync candidates and the per-pass candidate queue

use mirrorfs_common::TargetId;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Chunk path of the mirror root directory
pub const ROOT_PATH: &str = ".";

/// Chunk path of `name` inside directory `parent`
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == ROOT_PATH {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Chunk,
    Dir,
}

/// An object that may differ between primary and secondary
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResyncCandidate {
    /// Chunk path relative to the mirror root
    pub path: String,
    /// Primary target the object lives on
    pub target: TargetId,
    pub kind: CandidateKind,
}

impl ResyncCandidate {
    pub fn chunk(target: TargetId, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target,
            kind: CandidateKind::Chunk,
        }
    }

    pub fn dir(target: TargetId, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target,
            kind: CandidateKind::Dir,
        }
    }
}

/// Multi-producer, multi-consumer candidate queue of one pass.
///
/// Producers are gather threads, consumers are async push workers. A
/// candidate is accepted at most once per pass.
pub struct CandidateQueue {
    tx: Mutex<Option<UnboundedSender<ResyncCandidate>>>,
    rx: tokio::sync::Mutex<UnboundedReceiver<ResyncCandidate>>,
    seen: Mutex<HashSet<(CandidateKind, String)>>,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Queue a candidate; false if it was already queued or the queue is closed
    pub fn push(&self, candidate: ResyncCandidate) -> bool {
        if !self
            .seen
            .lock()
            .insert((candidate.kind, candidate.path.clone()))
        {
            return false;
        }
        self.tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(candidate).is_ok())
    }

    /// No more candidates will be accepted; consumers drain what is queued
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Next candidate, or `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<ResyncCandidate> {
        self.rx.lock().await.recv().await
    }

    /// Number of distinct candidates accepted so far
    #[must_use]
    pub fn accepted(&self) -> usize {
        self.seen.lock().len()
    }
}
