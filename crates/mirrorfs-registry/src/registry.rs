//! Registry facade
//!
//! Owns the buddy group mapper and the target state store. Every call that
//! changes persisted state bumps a generation counter and wakes the
//! persistence flusher.

use crate::mapper::{BuddyGroup, BuddyGroupMapper};
use crate::persist::RegistrySnapshot;
use crate::state::{BuddyComm, StateCause, TargetStateStore};
use mirrorfs_common::config::GroupConfig;
use mirrorfs_common::{
    CombinedTargetState, ConsistencyState, Error, GroupId, MirrorRole, ReachabilityState, Result,
    TargetId,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Registry {
    mapper: BuddyGroupMapper,
    states: TargetStateStore,
    generation: AtomicU64,
    changed: Notify,
    /// Random identity of this registry instance
    instance: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            mapper: BuddyGroupMapper::default(),
            states: TargetStateStore::default(),
            generation: AtomicU64::new(0),
            changed: Notify::new(),
            instance: rand::random(),
        }
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of this registry; targets sharing it share one view of all states
    #[must_use]
    pub const fn instance(&self) -> u64 {
        self.instance
    }

    /// Rebuild a registry from persisted state
    #[must_use]
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        registry.mapper.replace_all(snapshot.groups);
        registry.states.replace_all(snapshot.targets);
        registry
    }

    /// Build a registry from configured groups; all members start online and good
    pub fn from_groups(groups: &[GroupConfig]) -> Result<Self> {
        let registry = Self::new();
        for group in groups {
            registry.add_target(group.primary);
            registry.add_target(group.secondary);
            registry.map_group(Some(group.id), group.primary, group.secondary, false)?;
        }
        Ok(registry)
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            groups: self.mapper.groups(),
            targets: self.states.records(),
        }
    }

    /// Counter bumped by every persisted change
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Resolves after the next persisted change (or immediately if one is pending)
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_one();
    }

    // ---- targets ----

    /// Register a target as online and good; returns false if it was known already
    pub fn add_target(&self, id: TargetId) -> bool {
        let added = self.states.add_target(id, CombinedTargetState::default());
        if added {
            self.mark_dirty();
        }
        added
    }

    #[must_use]
    pub fn has_target(&self, id: TargetId) -> bool {
        self.states.contains(id)
    }

    pub fn state(&self, id: TargetId) -> Result<CombinedTargetState> {
        self.states.get(id)
    }

    /// Force both parts of a target's state.
    ///
    /// When a primary becomes bad the caller decides whether to switch over.
    pub fn set_state(
        &self,
        id: TargetId,
        consistency: ConsistencyState,
        reachability: ReachabilityState,
        cause: StateCause,
    ) -> Result<CombinedTargetState> {
        let old = self.states.set_state(
            id,
            CombinedTargetState::new(reachability, consistency),
            cause,
        )?;
        self.mark_dirty();
        Ok(old)
    }

    pub fn set_consistency(
        &self,
        id: TargetId,
        consistency: ConsistencyState,
        cause: StateCause,
    ) -> Result<ConsistencyState> {
        let old = self.states.set_consistency(id, consistency, cause)?;
        if old != consistency {
            self.mark_dirty();
        }
        Ok(old)
    }

    /// Compare-and-set on a target's consistency; [`Error::Again`] if it moved
    pub fn change_consistency(
        &self,
        id: TargetId,
        expected: ConsistencyState,
        new: ConsistencyState,
        cause: StateCause,
    ) -> Result<()> {
        self.states.change_consistency(id, expected, new, cause)?;
        if expected != new {
            self.mark_dirty();
        }
        Ok(())
    }

    pub fn set_reachability(
        &self,
        id: TargetId,
        reachability: ReachabilityState,
    ) -> Result<ReachabilityState> {
        let old = self.states.set_reachability(id, reachability)?;
        if old != reachability {
            self.mark_dirty();
        }
        Ok(old)
    }

    /// Refresh a target's liveness; returns true if it came back online
    pub fn report_online(&self, id: TargetId) -> Result<bool> {
        let changed = self.states.report_online(id)?;
        if changed {
            self.mark_dirty();
        }
        Ok(changed)
    }

    /// Demote targets that stopped reporting
    pub fn age_reachability(
        &self,
        probably_offline_after: Duration,
        offline_after: Duration,
    ) -> Vec<(TargetId, ReachabilityState)> {
        let changed = self
            .states
            .age_reachability(probably_offline_after, offline_after);
        if !changed.is_empty() {
            self.mark_dirty();
        }
        changed
    }

    pub fn buddy_comm(&self, id: TargetId) -> Result<BuddyComm> {
        self.states.buddy_comm(id)
    }

    /// Record a successful exchange between `id` and its buddy
    pub fn touch_buddy_comm(&self, id: TargetId, secs: u64) -> Result<()> {
        if self.states.touch_buddy_comm(id, secs)? {
            self.mark_dirty();
        }
        Ok(())
    }

    /// Set (non-zero) or clear (zero) the buddy communication override of `id`
    pub fn set_buddy_comm_override(&self, id: TargetId, secs: u64) -> Result<()> {
        self.states.set_buddy_comm_override(id, secs)?;
        self.mark_dirty();
        Ok(())
    }

    // ---- groups ----

    /// Create or update a buddy group; both targets must be registered
    pub fn map_group(
        &self,
        id: Option<GroupId>,
        primary: TargetId,
        secondary: TargetId,
        allow_update: bool,
    ) -> Result<GroupId> {
        for target in [primary, secondary] {
            if !self.states.contains(target) {
                return Err(Error::UnknownTarget(target));
            }
        }
        let id = self.mapper.map_group(id, primary, secondary, allow_update)?;
        info!(group_id = %id, %primary, %secondary, "Mapped buddy group");
        self.mark_dirty();
        Ok(id)
    }

    pub fn unmap_group(&self, id: GroupId) -> Result<()> {
        if !self.mapper.unmap_group(id) {
            return Err(Error::UnknownGroup(id));
        }
        self.mark_dirty();
        Ok(())
    }

    pub fn group(&self, id: GroupId) -> Result<BuddyGroup> {
        self.mapper.get(id)
    }

    /// `(primary, secondary)` of a group
    pub fn resolve(&self, id: GroupId) -> Result<(TargetId, TargetId)> {
        self.mapper.resolve(id)
    }

    #[must_use]
    pub fn groups(&self) -> Vec<BuddyGroup> {
        self.mapper.groups()
    }

    #[must_use]
    pub fn group_of(&self, target: TargetId) -> Option<(GroupId, MirrorRole)> {
        self.mapper.group_of(target)
    }

    #[must_use]
    pub fn buddy_of(&self, target: TargetId) -> Option<TargetId> {
        self.mapper.buddy_of(target)
    }

    /// Swap primary and secondary unconditionally.
    ///
    /// Two calls in a row restore the original assignment; callers that react
    /// to failures should use [`Registry::check_switchover`].
    pub fn switchover(&self, id: GroupId) -> Result<BuddyGroup> {
        let group = self.mapper.switchover(id)?;
        warn!(
            group_id = %id,
            primary = %group.primary,
            secondary = %group.secondary,
            "Buddy group switched over"
        );
        self.mark_dirty();
        Ok(group)
    }

    /// Switch over only if the primary is offline or bad and the secondary is online and good.
    ///
    /// Returns whether a switchover happened.
    pub fn check_switchover(&self, id: GroupId) -> Result<bool> {
        let (primary, secondary) = self.resolve(id)?;
        let primary_state = self.state(primary)?;
        let secondary_state = self.state(secondary)?;

        let primary_failed = primary_state.reachability == ReachabilityState::Offline
            || primary_state.consistency == ConsistencyState::Bad;
        if !primary_failed || !secondary_state.is_online_good() {
            return Ok(false);
        }

        self.switchover(id)?;
        Ok(true)
    }

    /// Run [`Registry::check_switchover`] on every group; returns the groups that switched
    pub fn check_all_switchovers(&self) -> Vec<GroupId> {
        self.groups()
            .into_iter()
            .filter(|g| match self.check_switchover(g.id) {
                Ok(switched) => switched,
                Err(e) => {
                    warn!(group_id = %g.id, "switchover check failed: {}", e);
                    false
                }
            })
            .map(|g| g.id)
            .collect()
    }
}
