//! Resync coordinator
//!
//! Drives resync passes of local primary targets: it checks the start
//! conditions, notifies the secondary, runs the gatherer and the push
//! workers, drains changes made during the pass, and finally declares the
//! secondary good again. It also receives the engine's resync hook calls.

use crate::candidate::{CandidateQueue, ResyncCandidate};
use crate::gather::{Gatherer, resync_threshold};
use crate::job::{JobState, JobStats, ResyncJob};
use crate::pusher::ChunkResyncer;
use crate::tree::FsTree;
use dashmap::DashMap;
use mirrorfs_common::config::ResyncConfig;
use mirrorfs_common::{
    ConsistencyState, Error, MirrorRole, ReachabilityState, Result, TargetId,
};
use mirrorfs_mirror::{
    MirrorRequest, NodeRouter, Operation, ResyncHook, TargetData, send_with_retry,
};
use mirrorfs_registry::{Registry, StateCause, unix_now};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Options of a resync start request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct StartOptions {
    /// Walk everything instead of only what changed since the last buddy communication
    #[serde(default)]
    pub ignore_timestamp: bool,
    /// Start even if the secondary is good
    #[serde(default)]
    pub force: bool,
}

pub struct ResyncCoordinator {
    registry: Arc<Registry>,
    router: Arc<NodeRouter>,
    config: ResyncConfig,
    jobs: DashMap<TargetId, Arc<ResyncJob>>,
}

impl ResyncCoordinator {
    #[must_use]
    pub fn new(registry: Arc<Registry>, router: Arc<NodeRouter>, config: ResyncConfig) -> Self {
        Self {
            registry,
            router,
            config,
            jobs: DashMap::new(),
        }
    }

    /// Start a pass for local primary `target` in the background.
    ///
    /// The returned handle resolves to the statistics of the finished pass.
    pub fn start(
        self: &Arc<Self>,
        target: TargetId,
        options: StartOptions,
    ) -> Result<JoinHandle<JobStats>> {
        let resyncer = Arc::new(self.check_start(target, options)?);
        let secondary = resyncer.secondary;

        let job = Arc::clone(
            self.jobs
                .entry(target)
                .or_insert_with(|| Arc::new(ResyncJob::new(target)))
                .value(),
        );
        if !job.try_begin() {
            return Err(Error::ResyncAlreadyRunning(target));
        }

        // Changes are recorded from here on; the secondary stops receiving
        // forwards once it is no longer good.
        if let Err(e) = self.registry.set_consistency(
            secondary,
            ConsistencyState::NeedsResync,
            StateCause::Resync,
        ) {
            job.finish(JobState::Aborted, Some(e.to_string()));
            return Err(e);
        }

        info!(
            target_id = %target,
            secondary = %secondary,
            ignore_timestamp = options.ignore_timestamp,
            "Resync started"
        );

        let coordinator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let result = coordinator.run_pass(&job, &resyncer, options).await;
            coordinator.finish_pass(&job, &resyncer, result)
        }))
    }

    /// Ask a running pass to stop; it ends as aborted
    pub fn stop(&self, target: TargetId) -> Result<()> {
        match self.jobs.get(&target) {
            Some(job) if job.is_running() => {
                job.request_stop();
                info!(target_id = %target, "Resync stop requested");
                Ok(())
            }
            _ => Err(Error::ResyncNotRunning(target)),
        }
    }

    /// Statistics of the current or last pass of `target`
    #[must_use]
    pub fn stats(&self, target: TargetId) -> Option<JobStats> {
        self.jobs.get(&target).map(|job| job.stats())
    }

    /// Statistics of every job, ordered by target
    #[must_use]
    pub fn all_stats(&self) -> Vec<JobStats> {
        let mut stats: Vec<_> = self.jobs.iter().map(|job| job.stats()).collect();
        stats.sort_by_key(|s| s.target);
        stats
    }

    #[must_use]
    pub fn is_running(&self, target: TargetId) -> bool {
        self.jobs.get(&target).is_some_and(|job| job.is_running())
    }

    fn check_start(&self, target: TargetId, options: StartOptions) -> Result<ChunkResyncer> {
        let engine = self.router.engine(target).ok_or(Error::UnknownTarget(target))?;
        let TargetData::Chunks(chunks) = engine.data() else {
            return Err(Error::ResyncRefused(format!(
                "target {target} is not a storage target"
            )));
        };

        let (group, role) = self.registry.group_of(target).ok_or_else(|| {
            Error::ResyncRefused(format!("target {target} is not in a buddy group"))
        })?;
        if role != MirrorRole::Primary {
            return Err(Error::ResyncRefused(format!(
                "target {target} is not primary of buddy group {group}"
            )));
        }
        let (_, secondary) = self.registry.resolve(group)?;

        let local_state = self.registry.state(target)?;
        if local_state.consistency != ConsistencyState::Good {
            return Err(Error::ResyncRefused(format!(
                "target {target} is {local_state} and cannot be a resync source"
            )));
        }
        let secondary_state = self.registry.state(secondary)?;
        if secondary_state.reachability == ReachabilityState::Offline {
            return Err(Error::ResyncRefused(format!(
                "secondary {secondary} is offline"
            )));
        }
        if secondary_state.consistency == ConsistencyState::Good && !options.force {
            return Err(Error::ResyncRefused(format!(
                "secondary {secondary} is already good"
            )));
        }

        let config = engine.config();
        Ok(ChunkResyncer {
            local: target,
            secondary,
            group,
            chunks: Arc::clone(chunks),
            locks: Arc::clone(engine.locks()),
            transport: engine.transport(),
            policy: config.retry,
            lock_timeout: config.lock_timeout,
        })
    }

    async fn run_pass(
        &self,
        job: &Arc<ResyncJob>,
        resyncer: &Arc<ChunkResyncer>,
        options: StartOptions,
    ) -> Result<()> {
        // An unreachable secondary fails the pass before any walking
        resyncer.send(Operation::ResyncStarted).await?;

        // The secondary's node stops serving reads from it until the pass completes
        let engine = self
            .router
            .engine(resyncer.local)
            .ok_or(Error::UnknownTarget(resyncer.local))?;
        engine
            .report_buddy_state(resyncer.group, resyncer.secondary)
            .await?
            .into_result()?;

        let threshold = resync_threshold(
            &self.registry.buddy_comm(resyncer.local)?,
            self.config.safety_threshold(),
            options.ignore_timestamp,
        );
        debug!(target_id = %resyncer.local, threshold, "Gathering resync candidates");

        let queue = Arc::new(CandidateQueue::new());
        let gather = {
            let (job, queue) = (Arc::clone(job), Arc::clone(&queue));
            let tree = FsTree::new(resyncer.chunks.mirror_root());
            let target = resyncer.local;
            let workers = self.config.gather_workers;
            tokio::task::spawn_blocking(move || {
                let result = Gatherer {
                    tree: &tree,
                    target,
                    threshold,
                    queue: &queue,
                    counters: job.counters(),
                    stop: job.stop_flag(),
                }
                .run(workers);
                queue.close();
                result
            })
        };

        let consecutive_failures = Arc::new(AtomicU32::new(0));
        let pushers: Vec<_> = (0..self.config.sync_workers.max(1))
            .map(|_| {
                tokio::spawn(push_worker(
                    Arc::clone(job),
                    Arc::clone(&queue),
                    Arc::clone(resyncer),
                    Arc::clone(&consecutive_failures),
                    self.config.max_consecutive_push_failures,
                ))
            })
            .collect();

        let gathered = gather
            .await
            .map_err(|e| Error::internal(format!("gather task failed: {e}")));
        for pusher in pushers {
            pusher
                .await
                .map_err(|e| Error::internal(format!("push task failed: {e}")))?;
        }
        gathered??;

        self.drain_changes(job, resyncer).await
    }

    /// Push changes recorded during the pass, then declare the secondary good
    async fn drain_changes(&self, job: &ResyncJob, resyncer: &ChunkResyncer) -> Result<()> {
        loop {
            if job.is_stopping() {
                return Err(Error::ResyncRefused("resync stopped".to_string()));
            }
            let errors = job.error_count();
            if errors > 0 {
                return Err(Error::ResyncRefused(format!(
                    "{errors} objects could not be synced"
                )));
            }

            let completed = job.complete_if_drained(|| {
                self.registry.change_consistency(
                    resyncer.secondary,
                    ConsistencyState::NeedsResync,
                    ConsistencyState::Good,
                    StateCause::ResyncCompleted,
                )
            })?;
            if completed {
                return Ok(());
            }

            let changed: BTreeSet<String> = job.take_changes().into_iter().collect();
            debug!(
                target_id = %resyncer.local,
                count = changed.len(),
                "Syncing chunks changed during resync"
            );
            for path in changed {
                let candidate = ResyncCandidate::chunk(resyncer.local, path);
                match resyncer.push(&candidate).await {
                    Ok(outcome) => job.record_push(candidate.kind, outcome),
                    Err(e) => {
                        warn!(target_id = %resyncer.local, path = %candidate.path, "push failed: {}", e);
                        job.record_error(candidate.kind);
                    }
                }
            }
        }
    }

    fn finish_pass(&self, job: &ResyncJob, resyncer: &ChunkResyncer, result: Result<()>) -> JobStats {
        let target = job.target();
        let secondary = resyncer.secondary;
        match result {
            Ok(()) => {
                if let Some(engine) = self.router.engine(target) {
                    engine.publish_buddy_state(resyncer.group, secondary);
                }
                let now = unix_now();
                if let Err(e) = self.registry.touch_buddy_comm(target, now) {
                    warn!(target_id = %target, "cannot record buddy communication: {}", e);
                }
                if let Err(e) = self.registry.set_buddy_comm_override(target, 0) {
                    warn!(target_id = %target, "cannot clear buddy communication override: {}", e);
                }
                if let Err(e) = self.registry.report_online(secondary) {
                    warn!(target_id = %secondary, "cannot refresh reachability: {}", e);
                }
                job.finish(JobState::Completed, None);
                let stats = job.stats();
                info!(
                    target_id = %target,
                    secondary = %secondary,
                    synced_files = stats.synced_files,
                    synced_dirs = stats.synced_dirs,
                    removed = stats.removed,
                    "Resync completed"
                );
                stats
            }
            Err(e) => {
                error!(target_id = %target, secondary = %secondary, "Resync aborted: {}", e);
                job.finish(JobState::Aborted, Some(e.to_string()));
                job.stats()
            }
        }
    }

    /// Start a pass for every local primary whose buddy is reachable but not good.
    ///
    /// Returns the targets a pass was started for.
    pub fn check_buddies(self: &Arc<Self>) -> Vec<TargetId> {
        let mut started = Vec::new();
        for engine in self.router.engines() {
            let target = engine.target();
            if !matches!(engine.data(), TargetData::Chunks(_)) || self.is_running(target) {
                continue;
            }
            let Some((_, MirrorRole::Primary)) = self.registry.group_of(target) else {
                continue;
            };
            let Some(buddy) = self.registry.buddy_of(target) else {
                continue;
            };
            let (Ok(local), Ok(remote)) = (self.registry.state(target), self.registry.state(buddy))
            else {
                continue;
            };
            if local.consistency != ConsistencyState::Good
                || remote.reachability != ReachabilityState::Online
                || remote.consistency == ConsistencyState::Good
            {
                continue;
            }

            match self.start(target, StartOptions::default()) {
                Ok(_) => started.push(target),
                Err(e) => debug!(target_id = %target, "automatic resync not started: {}", e),
            }
        }
        started
    }

    /// Contact the buddy of every local target and refresh its reachability on success.
    ///
    /// A primary sends its view of the secondary's consistency, which also
    /// repairs reports lost earlier; a secondary pings its primary.
    pub async fn contact_buddies(&self) {
        for engine in self.router.engines() {
            let target = engine.target();
            let Some((group, role)) = self.registry.group_of(target) else {
                continue;
            };
            let Some(buddy) = self.registry.buddy_of(target) else {
                continue;
            };
            let sent = if role == MirrorRole::Primary {
                engine.report_buddy_state(group, buddy).await
            } else {
                let request = MirrorRequest::local(buddy, Operation::Ping);
                let transport = engine.transport();
                send_with_retry(transport.as_ref(), buddy, &request, &engine.config().retry).await
            };
            match sent {
                Ok(response) => {
                    if let Err(e) = self.registry.report_online(buddy) {
                        debug!(target_id = %buddy, "cannot refresh reachability: {}", e);
                    }
                    if let Err(e) = response.result {
                        debug!(target_id = %target, buddy = %buddy, "buddy refused contact: {}", e.message);
                    }
                }
                Err(e) => debug!(target_id = %target, buddy = %buddy, "buddy unreachable: {}", e),
            }
        }
    }

    /// Append resync job series to `output` in Prometheus text format
    pub fn write_prometheus(&self, output: &mut String) {
        let stats = self.all_stats();
        let _ = writeln!(output, "# HELP mirrorfs_resync_running Whether a resync pass is running");
        let _ = writeln!(output, "# TYPE mirrorfs_resync_running gauge");
        for s in &stats {
            let _ = writeln!(
                output,
                "mirrorfs_resync_running{{target_id=\"{}\"}} {}",
                s.target,
                u8::from(s.state == JobState::Running)
            );
        }

        let _ = writeln!(
            output,
            "# HELP mirrorfs_resync_objects Objects handled by the current or last pass"
        );
        let _ = writeln!(output, "# TYPE mirrorfs_resync_objects gauge");
        for s in &stats {
            let series = [
                ("discovered_files", s.gather.discovered_files),
                ("matched_files", s.gather.matched_files),
                ("discovered_dirs", s.gather.discovered_dirs),
                ("matched_dirs", s.gather.matched_dirs),
                ("synced_files", s.synced_files),
                ("synced_dirs", s.synced_dirs),
                ("removed", s.removed),
                ("error_files", s.error_files),
                ("error_dirs", s.error_dirs),
            ];
            for (kind, value) in series {
                let _ = writeln!(
                    output,
                    "mirrorfs_resync_objects{{target_id=\"{}\",kind=\"{kind}\"}} {value}",
                    s.target
                );
            }
        }
    }
}

impl ResyncHook for ResyncCoordinator {
    fn record_change(&self, primary: TargetId, paths: &[String]) -> bool {
        let Some(job) = self.jobs.get(&primary).map(|j| Arc::clone(j.value())) else {
            return false;
        };
        job.record_changes(paths)
    }
}

async fn push_worker(
    job: Arc<ResyncJob>,
    queue: Arc<CandidateQueue>,
    resyncer: Arc<ChunkResyncer>,
    consecutive_failures: Arc<AtomicU32>,
    max_failures: u32,
) {
    while let Some(candidate) = queue.pop().await {
        // Keep draining after a stop so the gatherer never blocks
        if job.is_stopping() {
            continue;
        }
        match resyncer.push(&candidate).await {
            Ok(outcome) => {
                consecutive_failures.store(0, Ordering::Relaxed);
                job.record_push(candidate.kind, outcome);
            }
            Err(e) => {
                warn!(
                    target_id = %resyncer.local,
                    path = %candidate.path,
                    "push failed: {}",
                    e
                );
                job.record_error(candidate.kind);
                let failures = consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if max_failures > 0 && failures >= max_failures {
                    error!(
                        target_id = %resyncer.local,
                        failures,
                        "secondary keeps failing, stopping resync"
                    );
                    job.request_stop();
                }
            }
        }
    }
}
