//! Replicated-operation engine
//!
//! One [`MirrorEngine`] serves one local target. A request runs through
//! role check, side-effect preparation, lock acquisition, local execution,
//! and (for mutations on a group's primary) a forward to the secondary while
//! the locks are still held. The caller's result only depends on the local
//! execution; the forward outcome adjusts the secondary's state.
//!
//! Every registry keeps its own view of target states. Whenever a primary
//! changes its view of the secondary it reports the new consistency to the
//! secondary, whose engine applies it to the registry of its own node.

use crate::hook::ResyncHook;
use crate::message::{ForwardId, ForwardOutcome, MirrorRequest, MirrorResponse};
use crate::metrics::EngineMetrics;
use crate::op::{
    BuddyStateOp, ExecContext, ExecMode, MirroredOp, OpReply, Operation, TargetData,
};
use crate::replies::{ReplyCache, replay};
use crate::transport::{RequestHandler, RetryPolicy, Transport, send_with_retry};
use async_trait::async_trait;
use mirrorfs_common::config::MirroringConfig;
use mirrorfs_common::{ConsistencyState, Error, GroupId, ReachabilityState, Result, TargetId};
use mirrorfs_lock::{LockManager, LockSet};
use mirrorfs_registry::{Registry, StateCause, unix_now};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Lookups an operation may redo when a name changed before its locks were held
const RESOLVE_ATTEMPTS: usize = 3;

/// Engine tunables
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub lock_timeout: Duration,
    pub execute_timeout: Duration,
}

impl EngineConfig {
    #[must_use]
    pub const fn from_config(config: &MirroringConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            lock_timeout: config.lock_timeout(),
            execute_timeout: config.execute_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_config(&MirroringConfig::default())
    }
}

/// How this target takes part in a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Role {
    mode: ExecMode,
    /// Secondary to forward to after local success
    forward_to: Option<(GroupId, TargetId)>,
}

pub struct MirrorEngine {
    target: TargetId,
    data: TargetData,
    registry: Arc<Registry>,
    locks: Arc<LockManager>,
    transport: Arc<dyn Transport>,
    resync_hook: RwLock<Option<Arc<dyn ResyncHook>>>,
    config: EngineConfig,
    metrics: EngineMetrics,
    /// Outcomes of recent forwards executed as secondary
    replies: Arc<ReplyCache>,
    /// Forward IDs and buddy state versions; starts at the wall clock so
    /// that values keep growing across restarts
    seq: AtomicU64,
    /// Version of the newest buddy state report applied
    buddy_state_seen: Mutex<u64>,
}

impl MirrorEngine {
    pub fn new(
        target: TargetId,
        data: TargetData,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            target,
            data,
            registry,
            locks: Arc::new(LockManager::new()),
            transport,
            resync_hook: RwLock::new(None),
            config,
            metrics: EngineMetrics::default(),
            replies: Arc::new(ReplyCache::default()),
            seq: AtomicU64::new(clock_seed()),
            buddy_state_seen: Mutex::new(0),
        }
    }

    #[must_use]
    pub const fn target(&self) -> TargetId {
        self.target
    }

    #[must_use]
    pub const fn data(&self) -> &TargetData {
        &self.data
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Lock domains of this target, shared with resync repair writes
    #[must_use]
    pub const fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn replies(&self) -> &ReplyCache {
        &self.replies
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Route changes into a running resync pass instead of dropping them
    pub fn set_resync_hook(&self, hook: Arc<dyn ResyncHook>) {
        *self.resync_hook.write() = Some(hook);
    }

    /// Execute one request addressed to this target
    pub async fn handle(&self, request: MirrorRequest) -> MirrorResponse {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        let op_name = request.op.name();

        if request.target != self.target {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return MirrorResponse::error(&Error::UnknownTarget(request.target));
        }

        let role = match self.check_role(&request) {
            Ok(role) => role,
            Err(e) => {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(target_id = %self.target, op = op_name, "request rejected: {}", e);
                return MirrorResponse::error(&e);
            }
        };

        if let Operation::SetBuddyState(report) = &request.op {
            return match self.apply_buddy_state(report) {
                Ok(()) => MirrorResponse::ok(OpReply::Done, ForwardOutcome::NotRequired),
                Err(e) => MirrorResponse::error(&e),
            };
        }

        let forward_id = request
            .forward_id
            .filter(|_| request.flags.secondary_forward);
        match self.run(request.op, role, forward_id).await {
            Ok((reply, forward)) => {
                self.metrics.record_forward(&forward);
                MirrorResponse::ok(reply, forward)
            }
            Err(e) => {
                self.metrics.local_errors.fetch_add(1, Ordering::Relaxed);
                debug!(target_id = %self.target, op = op_name, "request failed: {}", e);
                MirrorResponse::error(&e)
            }
        }
    }

    fn check_role(&self, request: &MirrorRequest) -> Result<Role> {
        let Some(group) = request.group else {
            if request.flags.secondary_forward || request.op.from_primary() {
                return Err(Error::invalid_argument(format!(
                    "{} requires a buddy group",
                    request.op.name()
                )));
            }
            return Ok(Role {
                mode: ExecMode::Primary,
                forward_to: None,
            });
        };

        let (primary, secondary) = self.registry.resolve(group)?;

        if request.flags.secondary_forward || request.op.from_primary() {
            if secondary != self.target {
                return Err(Error::NotSecondary {
                    group,
                    target: self.target,
                });
            }
            return Ok(Role {
                mode: ExecMode::Secondary,
                forward_to: None,
            });
        }

        if request.op.changes_observable_state() {
            if primary != self.target {
                return Err(Error::NotPrimary {
                    group,
                    target: self.target,
                });
            }
            return Ok(Role {
                mode: ExecMode::Primary,
                forward_to: Some((group, secondary)),
            });
        }

        // Read-only requests
        if primary == self.target {
            Ok(Role {
                mode: ExecMode::Primary,
                forward_to: None,
            })
        } else if secondary == self.target {
            if self.registry.state(self.target)?.consistency != ConsistencyState::Good {
                return Err(Error::NotConsistent(self.target));
            }
            Ok(Role {
                mode: ExecMode::Secondary,
                forward_to: None,
            })
        } else {
            Err(Error::NotPrimary {
                group,
                target: self.target,
            })
        }
    }

    async fn run(
        &self,
        mut op: Operation,
        role: Role,
        forward_id: Option<ForwardId>,
    ) -> Result<(OpReply, ForwardOutcome)> {
        op.prepare(role.mode)?;
        let locks = self.lock_op(&mut op, role.mode).await?;

        // A resent forward holds the same locks as the first delivery, so
        // the first one has finished and recorded its outcome by now.
        if let Some(id) = forward_id
            && let Some(cached) = self.replies.get(&id)
        {
            drop(locks);
            self.metrics.forwards_replayed.fetch_add(1, Ordering::Relaxed);
            debug!(
                target_id = %self.target,
                origin = %id.origin,
                seq = id.seq,
                op = op.name(),
                "resent forward answered from reply cache"
            );
            return replay(cached).map(|reply| (reply, ForwardOutcome::NotRequired));
        }

        let mirrored_mutation = role.forward_to;

        // The blocking task owns the locks, so they stay held until the
        // execution really finished even if we stop waiting for it.
        let target = self.target;
        let data = self.data.clone();
        let mode = role.mode;
        let replies = Arc::clone(&self.replies);
        let task = tokio::task::spawn_blocking(move || {
            let result = op.execute(&ExecContext {
                target,
                mode,
                data: &data,
            });
            if let Some(id) = forward_id {
                replies.insert(id, &result);
            }
            (op, locks, result)
        });

        let (op, locks, result) = match tokio::time::timeout(self.config.execute_timeout, task).await
        {
            Ok(Ok(done)) => done,
            Ok(Err(join)) => return Err(Error::internal(format!("execution task failed: {join}"))),
            Err(_) => {
                if let Some((group, secondary)) = mirrored_mutation {
                    warn!(
                        target_id = %self.target,
                        group_id = %group,
                        "execution timed out, secondary {} may miss the change",
                        secondary
                    );
                    self.flag_needs_resync(group, secondary);
                }
                return Err(Error::Timeout);
            }
        };
        let reply = result?;

        let replayed = op.changes_observable_state() || op.is_resync();
        if role.mode == ExecMode::Secondary && replayed {
            if let Err(e) = self.registry.touch_buddy_comm(self.target, unix_now()) {
                debug!(target_id = %self.target, "cannot record buddy communication: {}", e);
            }
        }

        let forward = match mirrored_mutation {
            Some((group, secondary)) => self.forward(group, secondary, &op).await,
            None => ForwardOutcome::NotRequired,
        };
        drop(locks);

        Ok((reply, forward))
    }

    /// Take the locks `op` needs.
    ///
    /// On the primary, entries an operation found by name are looked up
    /// again once the locks are held; if the name moved on in between, the
    /// locks are released and the lookup is redone.
    async fn lock_op(&self, op: &mut Operation, mode: ExecMode) -> Result<LockSet> {
        for _ in 0..RESOLVE_ATTEMPTS {
            if mode == ExecMode::Primary {
                op.resolve_entries(&self.data)?;
            }
            let locks = self
                .locks
                .lock_all(op.required_locks(self.target), self.config.lock_timeout)
                .await?;
            if mode == ExecMode::Secondary || op.entries_current(&self.data) {
                return Ok(locks);
            }
            drop(locks);
        }
        Err(Error::Again)
    }

    /// Replay `op` on `secondary`; never fails the caller
    async fn forward(&self, group: GroupId, secondary: TargetId, op: &Operation) -> ForwardOutcome {
        if !self.secondary_in_sync(secondary) {
            let hook = self.resync_hook.read().clone();
            if hook.is_some_and(|h| h.record_change(self.target, &op.touched_chunks())) {
                debug!(
                    target_id = %self.target,
                    group_id = %group,
                    op = op.name(),
                    "change recorded for running resync"
                );
                return ForwardOutcome::RecordedForResync;
            }
            // A pass may have completed between the two checks
            if !self.secondary_in_sync(secondary) {
                self.flag_needs_resync(group, secondary);
                return ForwardOutcome::Skipped;
            }
        }

        let id = ForwardId {
            origin: self.target,
            seq: self.next_seq(),
        };
        let request = MirrorRequest::forward(secondary, group, id, op.clone());

        match send_with_retry(self.transport.as_ref(), secondary, &request, &self.config.retry).await
        {
            Ok(response) => match response.result {
                Ok(_) => {
                    debug!(
                        target_id = %self.target,
                        group_id = %group,
                        op = op.name(),
                        "forward acknowledged by {}",
                        secondary
                    );
                    if let Err(e) = self.registry.touch_buddy_comm(self.target, unix_now()) {
                        debug!(target_id = %self.target, "cannot record buddy communication: {}", e);
                    }
                    if let Err(e) = self.registry.report_online(secondary) {
                        debug!(target_id = %secondary, "cannot refresh reachability: {}", e);
                    }
                    ForwardOutcome::Acknowledged
                }
                Err(remote) => {
                    warn!(
                        target_id = %self.target,
                        group_id = %group,
                        op = op.name(),
                        "secondary {} diverged ({:?}): {}",
                        secondary,
                        remote.code,
                        remote.message
                    );
                    match self.registry.set_consistency(
                        secondary,
                        ConsistencyState::NeedsResync,
                        StateCause::Divergence,
                    ) {
                        Ok(_) => self.publish_buddy_state(group, secondary),
                        Err(e) => {
                            error!(target_id = %secondary, "cannot quarantine secondary: {}", e);
                        }
                    }
                    ForwardOutcome::Diverged(remote.code)
                }
            },
            Err(e) => {
                error!(
                    target_id = %self.target,
                    group_id = %group,
                    op = op.name(),
                    "forward to {} failed: {}",
                    secondary,
                    e
                );
                match self.registry.set_state(
                    secondary,
                    ConsistencyState::Bad,
                    ReachabilityState::Offline,
                    StateCause::CommunicationFailure,
                ) {
                    Ok(_) => self.publish_buddy_state(group, secondary),
                    Err(e) => error!(target_id = %secondary, "cannot mark secondary bad: {}", e),
                }
                ForwardOutcome::CommFailed
            }
        }
    }

    fn secondary_in_sync(&self, secondary: TargetId) -> bool {
        self.registry
            .state(secondary)
            .is_ok_and(|s| s.is_online_good())
    }

    /// Good -> NeedsResync; a secondary that is already not good stays as is
    fn flag_needs_resync(&self, group: GroupId, secondary: TargetId) {
        match self.registry.change_consistency(
            secondary,
            ConsistencyState::Good,
            ConsistencyState::NeedsResync,
            StateCause::Divergence,
        ) {
            Ok(()) => {
                warn!(target_id = %secondary, "secondary flagged for resync");
                self.publish_buddy_state(group, secondary);
            }
            Err(Error::Again) => {}
            Err(e) => error!(target_id = %secondary, "cannot flag secondary for resync: {}", e),
        }
    }

    /// Report this node's view of `secondary` to the secondary.
    ///
    /// The version is taken before the state is read, so a report that
    /// carries an older state always has the smaller version.
    fn buddy_state_request(&self, group: GroupId, secondary: TargetId) -> Result<MirrorRequest> {
        let version = self.next_seq();
        let consistency = self.registry.state(secondary)?.consistency;
        Ok(MirrorRequest::mirrored(
            secondary,
            group,
            Operation::SetBuddyState(BuddyStateOp {
                consistency,
                version,
                registry: self.registry.instance(),
            }),
        ))
    }

    /// Send the current view of `secondary` and wait for the reply
    pub async fn report_buddy_state(
        &self,
        group: GroupId,
        secondary: TargetId,
    ) -> Result<MirrorResponse> {
        let request = self.buddy_state_request(group, secondary)?;
        send_with_retry(self.transport.as_ref(), secondary, &request, &self.config.retry).await
    }

    /// Like [`MirrorEngine::report_buddy_state`], in the background
    pub fn publish_buddy_state(&self, group: GroupId, secondary: TargetId) {
        let request = match self.buddy_state_request(group, secondary) {
            Ok(request) => request,
            Err(e) => {
                debug!(target_id = %secondary, "cannot build buddy state report: {}", e);
                return;
            }
        };
        let transport = Arc::clone(&self.transport);
        let policy = self.config.retry;
        let target = self.target;
        tokio::spawn(async move {
            let result = send_with_retry(transport.as_ref(), secondary, &request, &policy)
                .await
                .and_then(MirrorResponse::into_result);
            if let Err(e) = result {
                debug!(
                    target_id = %target,
                    secondary = %secondary,
                    "buddy state report not delivered: {}",
                    e
                );
            }
        });
    }

    /// Apply a primary's view of this target to the local registry
    fn apply_buddy_state(&self, report: &BuddyStateOp) -> Result<()> {
        // Both targets share this registry; the view is already current
        if report.registry == self.registry.instance() {
            return Ok(());
        }

        let mut seen = self.buddy_state_seen.lock();
        if report.version <= *seen {
            debug!(
                target_id = %self.target,
                version = report.version,
                "ignoring outdated buddy state report"
            );
            return Ok(());
        }
        let old =
            self.registry
                .set_consistency(self.target, report.consistency, StateCause::PrimaryReport)?;
        *seen = report.version;
        if old != report.consistency {
            info!(
                target_id = %self.target,
                "primary reports this target {} (was {})",
                report.consistency,
                old
            );
        }
        Ok(())
    }
}

/// Nanoseconds since the Unix epoch
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX / 2))
}

#[async_trait]
impl RequestHandler for MirrorEngine {
    async fn handle(&self, request: MirrorRequest) -> MirrorResponse {
        Self::handle(self, request).await
    }
}
