//! Buddy group mapper
//!
//! Maps a buddy group ID to its (primary, secondary) target pair. Lookups take
//! a short read lock; mutations (mapping, unmapping, switchover) a write lock.

use mirrorfs_common::{Error, GroupId, MirrorRole, Result, TargetId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A buddy group: two targets mirroring each other
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyGroup {
    pub id: GroupId,
    pub primary: TargetId,
    pub secondary: TargetId,
}

impl BuddyGroup {
    /// Role of `target` in this group, if it is a member
    #[must_use]
    pub fn role_of(&self, target: TargetId) -> Option<MirrorRole> {
        if target == self.primary {
            Some(MirrorRole::Primary)
        } else if target == self.secondary {
            Some(MirrorRole::Secondary)
        } else {
            None
        }
    }

    /// The other member of the group
    #[must_use]
    pub fn buddy_of(&self, target: TargetId) -> Option<TargetId> {
        match self.role_of(target)? {
            MirrorRole::Primary => Some(self.secondary),
            MirrorRole::Secondary => Some(self.primary),
        }
    }
}

#[derive(Debug, Default)]
pub struct BuddyGroupMapper {
    groups: RwLock<HashMap<GroupId, BuddyGroup>>,
}

impl BuddyGroupMapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a group.
    ///
    /// `id == None` picks the lowest free ID. Target existence is checked by
    /// the caller; this only enforces group-level invariants.
    pub fn map_group(
        &self,
        id: Option<GroupId>,
        primary: TargetId,
        secondary: TargetId,
        allow_update: bool,
    ) -> Result<GroupId> {
        if primary == secondary {
            return Err(Error::invalid_argument(format!(
                "primary and secondary of a buddy group must differ (target {primary})"
            )));
        }

        let mut groups = self.groups.write();

        if let Some(id) = id
            && !allow_update
            && groups.contains_key(&id)
        {
            return Err(Error::GroupExists(id));
        }

        for target in [primary, secondary] {
            if let Some(other) = groups.values().find(|g| g.role_of(target).is_some())
                && Some(other.id) != id
            {
                return Err(Error::TargetInUse(target));
            }
        }

        let id = match id {
            Some(id) => id,
            None => Self::free_id(&groups)
                .ok_or_else(|| Error::internal("no free buddy group ID left"))?,
        };

        groups.insert(
            id,
            BuddyGroup {
                id,
                primary,
                secondary,
            },
        );
        Ok(id)
    }

    fn free_id(groups: &HashMap<GroupId, BuddyGroup>) -> Option<GroupId> {
        (1..=u16::MAX)
            .map(GroupId)
            .find(|id| !groups.contains_key(id))
    }

    /// Remove a group; returns whether it existed
    pub fn unmap_group(&self, id: GroupId) -> bool {
        self.groups.write().remove(&id).is_some()
    }

    /// Look up a group
    pub fn get(&self, id: GroupId) -> Result<BuddyGroup> {
        self.groups
            .read()
            .get(&id)
            .copied()
            .ok_or(Error::UnknownGroup(id))
    }

    /// `(primary, secondary)` of a group
    pub fn resolve(&self, id: GroupId) -> Result<(TargetId, TargetId)> {
        let group = self.get(id)?;
        Ok((group.primary, group.secondary))
    }

    /// Swap primary and secondary. Calling this twice restores the original assignment.
    pub fn switchover(&self, id: GroupId) -> Result<BuddyGroup> {
        let mut groups = self.groups.write();
        let group = groups.get_mut(&id).ok_or(Error::UnknownGroup(id))?;
        std::mem::swap(&mut group.primary, &mut group.secondary);
        Ok(*group)
    }

    /// Group `target` belongs to, with its role
    #[must_use]
    pub fn group_of(&self, target: TargetId) -> Option<(GroupId, MirrorRole)> {
        self.groups
            .read()
            .values()
            .find_map(|g| g.role_of(target).map(|role| (g.id, role)))
    }

    /// The buddy of `target`, if it is mapped
    #[must_use]
    pub fn buddy_of(&self, target: TargetId) -> Option<TargetId> {
        self.groups
            .read()
            .values()
            .find_map(|g| g.buddy_of(target))
    }

    /// All groups, ordered by ID
    #[must_use]
    pub fn groups(&self) -> Vec<BuddyGroup> {
        let mut groups: Vec<_> = self.groups.read().values().copied().collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    /// Replace every mapping at once
    pub fn replace_all(&self, groups: impl IntoIterator<Item = BuddyGroup>) {
        let mut map = self.groups.write();
        map.clear();
        map.extend(groups.into_iter().map(|g| (g.id, g)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switchover_twice_restores_assignment() {
        let mapper = BuddyGroupMapper::new();
        mapper
            .map_group(Some(GroupId(5)), TargetId(1), TargetId(2), false)
            .unwrap();

        let swapped = mapper.switchover(GroupId(5)).unwrap();
        assert_eq!(swapped.primary, TargetId(2));
        assert_eq!(mapper.group_of(TargetId(1)), Some((GroupId(5), MirrorRole::Secondary)));

        mapper.switchover(GroupId(5)).unwrap();
        assert_eq!(mapper.resolve(GroupId(5)).unwrap(), (TargetId(1), TargetId(2)));
    }

    #[test]
    fn test_map_group_checks() {
        let mapper = BuddyGroupMapper::new();
        assert!(matches!(
            mapper.map_group(Some(GroupId(1)), TargetId(1), TargetId(1), false),
            Err(Error::InvalidArgument(_))
        ));

        mapper
            .map_group(Some(GroupId(1)), TargetId(1), TargetId(2), false)
            .unwrap();
        assert!(matches!(
            mapper.map_group(Some(GroupId(1)), TargetId(3), TargetId(4), false),
            Err(Error::GroupExists(_))
        ));
        assert!(matches!(
            mapper.map_group(Some(GroupId(2)), TargetId(2), TargetId(3), false),
            Err(Error::TargetInUse(TargetId(2)))
        ));

        // Updating the same group with its own targets is fine
        mapper
            .map_group(Some(GroupId(1)), TargetId(2), TargetId(1), true)
            .unwrap();
        assert_eq!(mapper.resolve(GroupId(1)).unwrap(), (TargetId(2), TargetId(1)));
    }

    #[test]
    fn test_auto_assigned_ids_fill_gaps() {
        let mapper = BuddyGroupMapper::new();
        mapper
            .map_group(Some(GroupId(2)), TargetId(1), TargetId(2), false)
            .unwrap();
        let id = mapper.map_group(None, TargetId(3), TargetId(4), false).unwrap();
        assert_eq!(id, GroupId(1));
        let id = mapper.map_group(None, TargetId(5), TargetId(6), false).unwrap();
        assert_eq!(id, GroupId(3));

        assert!(mapper.unmap_group(GroupId(2)));
        assert!(!mapper.unmap_group(GroupId(2)));
        assert_eq!(mapper.buddy_of(TargetId(1)), None);
        assert_eq!(mapper.buddy_of(TargetId(6)), Some(TargetId(5)));
    }
}
