//! Pushes resync candidates from a primary to its secondary

use crate::candidate::{CandidateKind, ResyncCandidate};
use mirrorfs_common::{Error, GroupId, Result, TargetId};
use mirrorfs_lock::LockManager;
use mirrorfs_mirror::op::{ResyncChunkOp, ResyncDirOp, ResyncRemoveOp};
use mirrorfs_mirror::{MirrorRequest, Operation, RetryPolicy, Transport, send_with_retry};
use mirrorfs_store::ChunkStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// What a push did on the secondary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Chunk contents or directory listing transferred
    Synced,
    /// Object no longer exists on the primary and was removed on the secondary
    Removed,
}

pub struct ChunkResyncer {
    pub local: TargetId,
    pub secondary: TargetId,
    pub group: GroupId,
    pub chunks: Arc<ChunkStore>,
    pub locks: Arc<LockManager>,
    pub transport: Arc<dyn Transport>,
    pub policy: RetryPolicy,
    pub lock_timeout: Duration,
}

impl ChunkResyncer {
    /// Bring one candidate up to date on the secondary.
    ///
    /// A chunk stays locked from reading it until the secondary confirmed the
    /// write, so live I/O to that chunk waits while other chunks are free.
    pub async fn push(&self, candidate: &ResyncCandidate) -> Result<PushOutcome> {
        match candidate.kind {
            CandidateKind::Chunk => self.push_chunk(&candidate.path).await,
            CandidateKind::Dir => self.push_dir(&candidate.path).await,
        }
    }

    async fn push_chunk(&self, path: &str) -> Result<PushOutcome> {
        let _lock = self
            .locks
            .chunks()
            .lock(self.local, path, self.lock_timeout)
            .await?;

        let chunks = Arc::clone(&self.chunks);
        let owned = path.to_string();
        let read = tokio::task::spawn_blocking(move || chunks.read_all(&owned))
            .await
            .map_err(|e| Error::internal(format!("chunk read task failed: {e}")))?;

        let (op, outcome) = match read {
            Ok(data) => (
                Operation::ResyncChunk(ResyncChunkOp {
                    path: path.to_string(),
                    data,
                }),
                PushOutcome::Synced,
            ),
            Err(e) if e.is_not_found() => (
                Operation::ResyncRemove(ResyncRemoveOp {
                    path: path.to_string(),
                }),
                PushOutcome::Removed,
            ),
            Err(e) => return Err(e),
        };
        self.send(op).await?;
        Ok(outcome)
    }

    async fn push_dir(&self, path: &str) -> Result<PushOutcome> {
        let chunks = Arc::clone(&self.chunks);
        let owned = path.to_string();
        let listing = tokio::task::spawn_blocking(move || chunks.list_dir(&owned))
            .await
            .map_err(|e| Error::internal(format!("directory read task failed: {e}")))?;

        let (op, outcome) = match listing {
            Ok(entries) => (
                Operation::ResyncDir(ResyncDirOp {
                    path: path.to_string(),
                    children: entries.into_iter().map(|e| e.name).collect(),
                }),
                PushOutcome::Synced,
            ),
            Err(e) if e.is_not_found() => (
                Operation::ResyncRemove(ResyncRemoveOp {
                    path: path.to_string(),
                }),
                PushOutcome::Removed,
            ),
            Err(e) => return Err(e),
        };
        self.send(op).await?;
        Ok(outcome)
    }

    /// Send a resync operation to the secondary and wait for its result
    pub async fn send(&self, op: Operation) -> Result<()> {
        trace!(target_id = %self.local, op = op.name(), "pushing to {}", self.secondary);
        let request = MirrorRequest::mirrored(self.secondary, self.group, op);
        send_with_retry(self.transport.as_ref(), self.secondary, &request, &self.policy)
            .await?
            .into_result()
            .map(|_| ())
    }
}
