//! Registry persistence
//!
//! The registry state (groups and target states) is written as one JSON
//! document. Writes go to a temporary file that is fsynced and then renamed
//! over the old file, so a reader never observes a partial write.
//!
//! [`PersistHandle`] runs the write-through in the background: every
//! state-affecting registry call bumps a generation counter, and the flusher
//! writes the latest snapshot whenever the counter moved.

use crate::mapper::BuddyGroup;
use crate::registry::Registry;
use crate::state::TargetRecord;
use mirrorfs_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lower bound for the delay before retrying a failed write
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
/// Upper bound for the delay between retries of a failed write
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRY_FACTOR: u32 = 64;

/// Everything the registry persists
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub groups: Vec<BuddyGroup>,
    pub targets: Vec<TargetRecord>,
}

/// Stable storage for registry snapshots
pub trait StatePersistence: Send + Sync {
    /// Load the last saved snapshot, `None` if nothing was saved yet
    fn load(&self) -> Result<Option<RegistrySnapshot>>;

    /// Replace the stored snapshot
    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()>;
}

/// Snapshot stored as a JSON file
#[derive(Clone, Debug)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StatePersistence for JsonStateFile {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot = serde_json::from_slice(&data).map_err(|e| {
            Error::Serialization(format!(
                "failed to parse state file {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::Serialization(format!("failed to encode state: {e}")))?;

        let temp_path = self.temp_path();
        {
            let mut file = std::fs::File::create(&temp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }

        // Atomic rename
        std::fs::rename(&temp_path, &self.path)?;
        debug!("Wrote registry state to {:?}", self.path);
        Ok(())
    }
}

/// Background writer keeping the state file in step with a [`Registry`]
pub struct PersistHandle {
    registry: Arc<Registry>,
    backend: Arc<dyn StatePersistence>,
    /// Generation of the last successful write; also serializes writers
    saved: Arc<Mutex<u64>>,
    stop: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PersistHandle {
    /// Start the flusher.
    ///
    /// After a change the flusher waits `coalesce` before writing, so a
    /// burst of changes costs a single write.
    pub fn spawn(
        registry: Arc<Registry>,
        backend: Arc<dyn StatePersistence>,
        coalesce: Duration,
    ) -> Self {
        let saved = Arc::new(Mutex::new(0));
        let (stop, mut stop_rx) = watch::channel(false);

        let task = {
            let registry = Arc::clone(&registry);
            let backend = Arc::clone(&backend);
            let saved = Arc::clone(&saved);
            tokio::spawn(async move {
                let retry_delay = coalesce.max(MIN_RETRY_DELAY);
                'flusher: loop {
                    tokio::select! {
                        () = registry.changed() => {}
                        _ = stop_rx.changed() => break,
                    }
                    tokio::time::sleep(coalesce).await;

                    // A failed write is retried until it lands, without waiting
                    // for another change.
                    let mut failures: u32 = 0;
                    while let Err(e) = write_if_dirty(&registry, &backend, &saved).await {
                        failures = failures.saturating_add(1);
                        error!(failures, "Failed to persist registry state: {}", e);
                        let delay = retry_delay
                            .saturating_mul(failures.min(MAX_RETRY_FACTOR))
                            .min(MAX_RETRY_DELAY.max(retry_delay));
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            _ = stop_rx.changed() => break 'flusher,
                        }
                    }
                }
                debug!("Registry persistence task stopped");
            })
        };

        Self {
            registry,
            backend,
            saved,
            stop,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Write the current state now if it changed since the last write
    pub async fn flush(&self) -> Result<()> {
        write_if_dirty(&self.registry, &self.backend, &self.saved).await
    }

    /// Stop the flusher after writing any pending change
    pub async fn shutdown(&self) -> Result<()> {
        self.stop.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Registry persistence task failed: {}", e);
        }
        self.flush().await
    }
}

async fn write_if_dirty(
    registry: &Arc<Registry>,
    backend: &Arc<dyn StatePersistence>,
    saved: &Mutex<u64>,
) -> Result<()> {
    let mut saved = saved.lock().await;
    let generation = registry.generation();
    if generation == *saved {
        return Ok(());
    }

    let snapshot = registry.snapshot();
    let backend = Arc::clone(backend);
    tokio::task::spawn_blocking(move || backend.save(&snapshot))
        .await
        .map_err(|e| Error::internal(format!("persistence task panicked: {e}")))??;

    *saved = generation;
    Ok(())
}

/// Load the registry from `backend`, or build it from `bootstrap` if nothing was saved
pub fn load_or_bootstrap(
    backend: &dyn StatePersistence,
    bootstrap: impl FnOnce() -> Result<Registry>,
) -> Result<Registry> {
    match backend.load()? {
        Some(snapshot) => {
            info!(
                groups = snapshot.groups.len(),
                targets = snapshot.targets.len(),
                "Loaded registry state"
            );
            Ok(Registry::from_snapshot(snapshot))
        }
        None => {
            info!("No registry state found, bootstrapping from configuration");
            bootstrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateCause;
    use mirrorfs_common::{ConsistencyState, GroupId, TargetId};

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.add_target(TargetId(1));
        registry.add_target(TargetId(2));
        registry
            .map_group(Some(GroupId(5)), TargetId(1), TargetId(2), false)
            .unwrap();
        registry
    }

    #[test]
    fn test_json_state_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonStateFile::new(dir.path().join("state.json"));
        assert!(file.load().unwrap().is_none());

        let snapshot = registry().snapshot();
        file.save(&snapshot).unwrap();
        assert_eq!(file.load().unwrap(), Some(snapshot));
        assert!(!file.temp_path().exists());
    }

    #[test]
    fn test_interrupted_write_keeps_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonStateFile::new(dir.path().join("state.json"));
        let reg = registry();
        let before = reg.snapshot();
        file.save(&before).unwrap();

        // A crash after the temp file was partly written but before the rename
        reg.set_consistency(TargetId(2), ConsistencyState::Bad, StateCause::CommunicationFailure)
            .unwrap();
        let partial = serde_json::to_vec(&reg.snapshot()).unwrap();
        std::fs::write(file.temp_path(), &partial[..partial.len() / 2]).unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded, before);

        // The next successful save replaces the stale temp file
        file.save(&reg.snapshot()).unwrap();
        assert_eq!(file.load().unwrap(), Some(reg.snapshot()));
    }

    #[tokio::test]
    async fn test_flusher_coalesces_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(JsonStateFile::new(dir.path().join("state.json")));
        let reg = Arc::new(registry());

        let handle = PersistHandle::spawn(
            Arc::clone(&reg),
            Arc::clone(&file) as Arc<dyn StatePersistence>,
            Duration::from_millis(10),
        );

        for _ in 0..10 {
            reg.set_consistency(TargetId(2), ConsistencyState::NeedsResync, StateCause::Resync)
                .unwrap();
            reg.set_consistency(TargetId(2), ConsistencyState::Bad, StateCause::Divergence)
                .unwrap();
        }

        handle.shutdown().await.unwrap();
        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded, reg.snapshot());

        let restored = Registry::from_snapshot(loaded);
        assert_eq!(
            restored.state(TargetId(2)).unwrap().consistency,
            ConsistencyState::Bad
        );
    }

    /// Fails the first `failures` saves, then writes to the wrapped file
    struct FailingFile {
        inner: JsonStateFile,
        failures: std::sync::atomic::AtomicU32,
        calls: std::sync::atomic::AtomicU32,
    }

    impl StatePersistence for FailingFile {
        fn load(&self) -> Result<Option<RegistrySnapshot>> {
            self.inner.load()
        }

        fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
            use std::sync::atomic::Ordering;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::internal("disk full"));
            }
            self.inner.save(snapshot)
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_without_further_changes() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(FailingFile {
            inner: JsonStateFile::new(dir.path().join("state.json")),
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let reg = Arc::new(registry());
        let handle = PersistHandle::spawn(
            Arc::clone(&reg),
            Arc::clone(&file) as Arc<dyn StatePersistence>,
            Duration::from_millis(10),
        );

        reg.set_consistency(TargetId(2), ConsistencyState::Bad, StateCause::Divergence)
            .unwrap();

        // No further change happens; the flusher has to get there on its own
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(saved)) = file.load()
                    && saved == reg.snapshot()
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("state was never written");
        assert!(file.calls.load(Ordering::SeqCst) >= 3);

        let restored = Registry::from_snapshot(file.load().unwrap().unwrap());
        assert_eq!(
            restored.state(TargetId(2)).unwrap().consistency,
            ConsistencyState::Bad
        );
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_load_or_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonStateFile::new(dir.path().join("state.json"));

        let reg = load_or_bootstrap(&file, || Ok(registry())).unwrap();
        assert_eq!(reg.resolve(GroupId(5)).unwrap(), (TargetId(1), TargetId(2)));

        reg.switchover(GroupId(5)).unwrap();
        file.save(&reg.snapshot()).unwrap();

        let reg = load_or_bootstrap(&file, || Err(Error::internal("not used"))).unwrap();
        assert_eq!(reg.resolve(GroupId(5)).unwrap(), (TargetId(2), TargetId(1)));
    }
}
