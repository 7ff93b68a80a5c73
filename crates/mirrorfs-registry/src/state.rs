//! Target state store
//!
//! Tracks reachability and consistency of every known target, plus the last
//! time each target successfully talked to its buddy (used to bound resync).

use mirrorfs_common::{
    CombinedTargetState, ConsistencyState, Error, ReachabilityState, Result, TargetId,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Why a state is being changed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateCause {
    /// A resync pass brought the target back in sync
    ResyncCompleted,
    /// Operator action
    Admin,
    /// A resync pass started or aborted
    Resync,
    /// Forwarding to the target failed to connect or time out
    CommunicationFailure,
    /// The target rejected a forwarded operation its primary executed
    Divergence,
    /// Heartbeat or reachability ageing
    Heartbeat,
    /// The group's primary reported its view of this secondary
    PrimaryReport,
}

impl StateCause {
    /// Whether this cause may move a target back to `Good`
    #[must_use]
    pub const fn may_restore_good(self) -> bool {
        matches!(self, Self::ResyncCompleted | Self::Admin | Self::PrimaryReport)
    }
}

/// Last successful communication with the buddy, seconds since the Unix epoch.
///
/// A non-zero `override_secs` replaces `last_comm_secs` until it is cleared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyComm {
    pub last_comm_secs: u64,
    pub override_secs: u64,
}

impl BuddyComm {
    /// Effective timestamp and whether it comes from an override
    #[must_use]
    pub const fn effective(&self) -> (u64, bool) {
        if self.override_secs == 0 {
            (self.last_comm_secs, false)
        } else {
            (self.override_secs, true)
        }
    }
}

/// Persisted view of one target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: TargetId,
    pub state: CombinedTargetState,
    #[serde(default)]
    pub buddy_comm: BuddyComm,
}

#[derive(Debug)]
struct TargetEntry {
    state: CombinedTargetState,
    buddy_comm: BuddyComm,
    last_report: Instant,
}

/// Current wall-clock time in seconds since the Unix epoch
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[derive(Debug, Default)]
pub struct TargetStateStore {
    targets: RwLock<HashMap<TargetId, TargetEntry>>,
}

impl TargetStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target; an existing target keeps its state
    pub fn add_target(&self, id: TargetId, state: CombinedTargetState) -> bool {
        let mut targets = self.targets.write();
        if targets.contains_key(&id) {
            return false;
        }
        targets.insert(
            id,
            TargetEntry {
                state,
                buddy_comm: BuddyComm::default(),
                last_report: Instant::now(),
            },
        );
        true
    }

    pub fn remove_target(&self, id: TargetId) -> bool {
        self.targets.write().remove(&id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: TargetId) -> bool {
        self.targets.read().contains_key(&id)
    }

    pub fn get(&self, id: TargetId) -> Result<CombinedTargetState> {
        self.targets
            .read()
            .get(&id)
            .map(|t| t.state)
            .ok_or(Error::UnknownTarget(id))
    }

    /// Set both parts of a target's state; returns the previous state
    pub fn set_state(
        &self,
        id: TargetId,
        state: CombinedTargetState,
        cause: StateCause,
    ) -> Result<CombinedTargetState> {
        let mut targets = self.targets.write();
        let entry = targets.get_mut(&id).ok_or(Error::UnknownTarget(id))?;
        check_transition(id, entry.state.consistency, state.consistency, cause)?;

        let old = entry.state;
        entry.state = state;
        if state.reachability == ReachabilityState::Online {
            entry.last_report = Instant::now();
        }
        log_change(id, old, state, cause);
        Ok(old)
    }

    /// Set a target's consistency; returns the previous consistency
    pub fn set_consistency(
        &self,
        id: TargetId,
        consistency: ConsistencyState,
        cause: StateCause,
    ) -> Result<ConsistencyState> {
        let mut targets = self.targets.write();
        let entry = targets.get_mut(&id).ok_or(Error::UnknownTarget(id))?;
        check_transition(id, entry.state.consistency, consistency, cause)?;

        let old = entry.state;
        entry.state.consistency = consistency;
        log_change(id, old, entry.state, cause);
        Ok(old.consistency)
    }

    /// Change consistency only if it currently equals `expected`.
    ///
    /// Fails with [`Error::Again`] when the state moved in the meantime.
    pub fn change_consistency(
        &self,
        id: TargetId,
        expected: ConsistencyState,
        new: ConsistencyState,
        cause: StateCause,
    ) -> Result<()> {
        let mut targets = self.targets.write();
        let entry = targets.get_mut(&id).ok_or(Error::UnknownTarget(id))?;
        if entry.state.consistency != expected {
            return Err(Error::Again);
        }
        check_transition(id, expected, new, cause)?;

        let old = entry.state;
        entry.state.consistency = new;
        log_change(id, old, entry.state, cause);
        Ok(())
    }

    /// Set a target's reachability; returns the previous reachability
    pub fn set_reachability(
        &self,
        id: TargetId,
        reachability: ReachabilityState,
    ) -> Result<ReachabilityState> {
        let mut targets = self.targets.write();
        let entry = targets.get_mut(&id).ok_or(Error::UnknownTarget(id))?;
        let old = entry.state;
        entry.state.reachability = reachability;
        if reachability == ReachabilityState::Online {
            entry.last_report = Instant::now();
        }
        log_change(id, old, entry.state, StateCause::Heartbeat);
        Ok(old.reachability)
    }

    /// A sign of life from `id`: refresh its report time and mark it online.
    ///
    /// Returns true if the reachability changed.
    pub fn report_online(&self, id: TargetId) -> Result<bool> {
        let mut targets = self.targets.write();
        let entry = targets.get_mut(&id).ok_or(Error::UnknownTarget(id))?;
        entry.last_report = Instant::now();
        if entry.state.reachability == ReachabilityState::Online {
            return Ok(false);
        }
        let old = entry.state;
        entry.state.reachability = ReachabilityState::Online;
        log_change(id, old, entry.state, StateCause::Heartbeat);
        Ok(true)
    }

    /// Demote targets that have not reported for a while.
    ///
    /// Returns the targets whose reachability changed, with their new value.
    pub fn age_reachability(
        &self,
        probably_offline_after: Duration,
        offline_after: Duration,
    ) -> Vec<(TargetId, ReachabilityState)> {
        let now = Instant::now();
        let mut changed = Vec::new();
        let mut targets = self.targets.write();
        for (id, entry) in targets.iter_mut() {
            let silent = now.saturating_duration_since(entry.last_report);
            let demoted = if silent >= offline_after {
                ReachabilityState::Offline
            } else if silent >= probably_offline_after {
                ReachabilityState::ProbablyOffline
            } else {
                continue;
            };
            // Ageing never promotes a target
            if demoted as u8 > entry.state.reachability as u8 {
                let old = entry.state;
                entry.state.reachability = demoted;
                log_change(*id, old, entry.state, StateCause::Heartbeat);
                changed.push((*id, demoted));
            }
        }
        changed
    }

    pub fn buddy_comm(&self, id: TargetId) -> Result<BuddyComm> {
        self.targets
            .read()
            .get(&id)
            .map(|t| t.buddy_comm)
            .ok_or(Error::UnknownTarget(id))
    }

    /// Record a successful exchange with the buddy at `secs`
    pub fn touch_buddy_comm(&self, id: TargetId, secs: u64) -> Result<bool> {
        let mut targets = self.targets.write();
        let entry = targets.get_mut(&id).ok_or(Error::UnknownTarget(id))?;
        if secs <= entry.buddy_comm.last_comm_secs {
            return Ok(false);
        }
        entry.buddy_comm.last_comm_secs = secs;
        Ok(true)
    }

    /// Set (non-zero) or clear (zero) the administrative override
    pub fn set_buddy_comm_override(&self, id: TargetId, secs: u64) -> Result<()> {
        let mut targets = self.targets.write();
        let entry = targets.get_mut(&id).ok_or(Error::UnknownTarget(id))?;
        entry.buddy_comm.override_secs = secs;
        Ok(())
    }

    /// All targets, ordered by ID
    #[must_use]
    pub fn records(&self) -> Vec<TargetRecord> {
        let mut records: Vec<_> = self
            .targets
            .read()
            .iter()
            .map(|(id, t)| TargetRecord {
                id: *id,
                state: t.state,
                buddy_comm: t.buddy_comm,
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Replace every target with the given records
    pub fn replace_all(&self, records: impl IntoIterator<Item = TargetRecord>) {
        let now = Instant::now();
        let mut targets = self.targets.write();
        targets.clear();
        targets.extend(records.into_iter().map(|r| {
            (
                r.id,
                TargetEntry {
                    state: r.state,
                    buddy_comm: r.buddy_comm,
                    last_report: now,
                },
            )
        }));
    }
}

fn check_transition(
    id: TargetId,
    old: ConsistencyState,
    new: ConsistencyState,
    cause: StateCause,
) -> Result<()> {
    if new == ConsistencyState::Good && old != ConsistencyState::Good && !cause.may_restore_good()
    {
        return Err(Error::invalid_argument(format!(
            "target {id} can only become good through resync or operator action, not {cause:?}"
        )));
    }
    Ok(())
}

fn log_change(
    id: TargetId,
    old: CombinedTargetState,
    new: CombinedTargetState,
    cause: StateCause,
) {
    if old == new {
        return;
    }
    if new.consistency == ConsistencyState::Good && old.consistency != ConsistencyState::Good {
        info!(target_id = %id, %old, %new, ?cause, "target is consistent again");
    } else {
        debug!(target_id = %id, %old, %new, ?cause, "target state changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(id: u16) -> TargetStateStore {
        let store = TargetStateStore::new();
        store.add_target(TargetId(id), CombinedTargetState::default());
        store
    }

    #[test]
    fn test_good_requires_resync_or_admin() {
        let store = store_with(1);
        let t = TargetId(1);
        store
            .set_consistency(t, ConsistencyState::NeedsResync, StateCause::Divergence)
            .unwrap();

        assert!(store
            .set_consistency(t, ConsistencyState::Good, StateCause::Heartbeat)
            .is_err());
        assert_eq!(store.get(t).unwrap().consistency, ConsistencyState::NeedsResync);

        store
            .set_consistency(t, ConsistencyState::Good, StateCause::ResyncCompleted)
            .unwrap();
        assert!(store.get(t).unwrap().is_online_good());
    }

    #[test]
    fn test_change_consistency_is_compare_and_set() {
        let store = store_with(1);
        let t = TargetId(1);
        let err = store
            .change_consistency(
                t,
                ConsistencyState::NeedsResync,
                ConsistencyState::Bad,
                StateCause::Admin,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Again));

        store
            .change_consistency(
                t,
                ConsistencyState::Good,
                ConsistencyState::NeedsResync,
                StateCause::Resync,
            )
            .unwrap();
        assert_eq!(store.get(t).unwrap().consistency, ConsistencyState::NeedsResync);
    }

    #[test]
    fn test_reachability_ageing() {
        let store = store_with(1);
        let t = TargetId(1);

        assert!(store
            .age_reachability(Duration::from_secs(60), Duration::from_secs(120))
            .is_empty());

        let changed = store.age_reachability(Duration::ZERO, Duration::from_secs(120));
        assert_eq!(changed, vec![(t, ReachabilityState::ProbablyOffline)]);

        let changed = store.age_reachability(Duration::ZERO, Duration::ZERO);
        assert_eq!(changed, vec![(t, ReachabilityState::Offline)]);

        // Already offline: nothing more to demote
        assert!(store.age_reachability(Duration::ZERO, Duration::ZERO).is_empty());

        assert!(store.report_online(t).unwrap());
        assert!(!store.report_online(t).unwrap());
        assert_eq!(store.get(t).unwrap().reachability, ReachabilityState::Online);
    }

    #[test]
    fn test_buddy_comm_override() {
        let store = store_with(1);
        let t = TargetId(1);
        assert_eq!(store.buddy_comm(t).unwrap().effective(), (0, false));

        assert!(store.touch_buddy_comm(t, 1000).unwrap());
        assert!(!store.touch_buddy_comm(t, 900).unwrap());
        assert_eq!(store.buddy_comm(t).unwrap().effective(), (1000, false));

        store.set_buddy_comm_override(t, 500).unwrap();
        assert_eq!(store.buddy_comm(t).unwrap().effective(), (500, true));

        store.set_buddy_comm_override(t, 0).unwrap();
        assert_eq!(store.buddy_comm(t).unwrap().effective(), (1000, false));
    }

    #[test]
    fn test_unknown_target() {
        let store = TargetStateStore::new();
        assert!(matches!(
            store.get(TargetId(9)),
            Err(Error::UnknownTarget(TargetId(9)))
        ));
    }
}
