//! Per-target resync job state and statistics

use crate::candidate::CandidateKind;
use crate::gather::{GatherCounters, GatherSnapshot};
use crate::pusher::PushOutcome;
use mirrorfs_common::{Result, TargetId};
use mirrorfs_registry::unix_now;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Statistics of the current or last pass of a target
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub target: TargetId,
    pub state: JobState,
    pub start_time: u64,
    pub end_time: u64,
    #[serde(flatten)]
    pub gather: GatherSnapshot,
    pub synced_files: u64,
    pub synced_dirs: u64,
    pub removed: u64,
    pub error_files: u64,
    pub error_dirs: u64,
    pub last_error: Option<String>,
}

/// Resync job of one primary target.
///
/// `running` is the single-instance guard: a pass starts only by flipping it
/// from false to true, so a second start while running is rejected.
#[derive(Debug)]
pub struct ResyncJob {
    target: TargetId,
    running: AtomicBool,
    stop: AtomicBool,
    state: Mutex<JobState>,
    last_error: Mutex<Option<String>>,
    start_time: AtomicU64,
    end_time: AtomicU64,
    counters: GatherCounters,
    synced_files: AtomicU64,
    synced_dirs: AtomicU64,
    removed: AtomicU64,
    error_files: AtomicU64,
    error_dirs: AtomicU64,
    /// Chunk paths changed on the primary during the pass; `None` when no
    /// pass accepts changes
    changes: Mutex<Option<Vec<String>>>,
}

impl ResyncJob {
    #[must_use]
    pub fn new(target: TargetId) -> Self {
        Self {
            target,
            running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            state: Mutex::new(JobState::Idle),
            last_error: Mutex::new(None),
            start_time: AtomicU64::new(0),
            end_time: AtomicU64::new(0),
            counters: GatherCounters::default(),
            synced_files: AtomicU64::new(0),
            synced_dirs: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            error_files: AtomicU64::new(0),
            error_dirs: AtomicU64::new(0),
            changes: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn target(&self) -> TargetId {
        self.target
    }

    /// Claim the job for a new pass and reset its statistics
    pub fn try_begin(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.stop.store(false, Ordering::Relaxed);
        self.counters.reset();
        for counter in [
            &self.synced_files,
            &self.synced_dirs,
            &self.removed,
            &self.error_files,
            &self.error_dirs,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.start_time.store(unix_now(), Ordering::Relaxed);
        self.end_time.store(0, Ordering::Relaxed);
        *self.last_error.lock() = None;
        *self.changes.lock() = Some(Vec::new());
        *self.state.lock() = JobState::Running;
        true
    }

    /// End the pass; stops accepting changes and releases the guard
    pub fn finish(&self, state: JobState, error: Option<String>) {
        *self.changes.lock() = None;
        *self.last_error.lock() = error;
        *self.state.lock() = state;
        self.end_time.store(unix_now(), Ordering::Relaxed);
        self.running.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn counters(&self) -> &GatherCounters {
        &self.counters
    }

    /// Add changed paths to the running pass; false if no pass accepts changes
    pub fn record_changes(&self, paths: &[String]) -> bool {
        match self.changes.lock().as_mut() {
            Some(changes) => {
                changes.extend_from_slice(paths);
                true
            }
            None => false,
        }
    }

    /// Take the changes recorded so far, leaving the pass open
    pub fn take_changes(&self) -> Vec<String> {
        self.changes
            .lock()
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// If no change is pending, run `complete` and stop accepting changes.
    ///
    /// Both happen under the change lock, so a change is either recorded
    /// before (and returned by the next [`take_changes`](Self::take_changes))
    /// or sees the pass closed and the effect of `complete`.
    pub fn complete_if_drained(&self, complete: impl FnOnce() -> Result<()>) -> Result<bool> {
        let mut changes = self.changes.lock();
        if changes.as_ref().is_some_and(|c| !c.is_empty()) {
            return Ok(false);
        }
        complete()?;
        *changes = None;
        Ok(true)
    }

    pub fn record_push(&self, kind: CandidateKind, outcome: PushOutcome) {
        let counter = match (kind, outcome) {
            (_, PushOutcome::Removed) => &self.removed,
            (CandidateKind::Chunk, PushOutcome::Synced) => &self.synced_files,
            (CandidateKind::Dir, PushOutcome::Synced) => &self.synced_dirs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: CandidateKind) {
        let counter = match kind {
            CandidateKind::Chunk => &self.error_files,
            CandidateKind::Dir => &self.error_dirs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_files.load(Ordering::Relaxed) + self.error_dirs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> JobStats {
        JobStats {
            target: self.target,
            state: *self.state.lock(),
            start_time: self.start_time.load(Ordering::Relaxed),
            end_time: self.end_time.load(Ordering::Relaxed),
            gather: self.counters.snapshot(),
            synced_files: self.synced_files.load(Ordering::Relaxed),
            synced_dirs: self.synced_dirs.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            error_files: self.error_files.load(Ordering::Relaxed),
            error_dirs: self.error_dirs.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}
