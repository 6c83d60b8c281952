//! Group Registry & Ordering.
//!
//! Groups are kept sorted by a sparse [`PositionKey`]. Appending leaves a gap
//! of [`POSITION_STEP`] so that a reorder usually rewrites only the moved
//! group's key; when a gap is exhausted the following neighbours are bumped
//! just enough to keep keys unique. Unmoved groups never change their order
//! relative to each other.

use crate::resolver::DependencyView;
use crate::stream::Observable;
use crate::tracking::Tracker;
use marbles_env::{GroupError, GroupId, VirtualClock};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use tracing::debug;

/// Gap between the keys of consecutively appended groups.
pub const POSITION_STEP: u64 = 1024;

/// Comparable on-screen position of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PositionKey(pub u64);

/// A user-authored stream definition.
///
/// Receives the dependency view, the run's private clock and the track
/// operator, and returns the stream to evaluate or a structured error.
pub trait Definition {
    /// Builds the group's stream for one run.
    fn construct(&self, deps: &DependencyView, clock: &VirtualClock, track: &Tracker) -> Result<Observable, GroupError>;
}

impl<F> Definition for F
where
    F: Fn(&DependencyView, &VirtualClock, &Tracker) -> Result<Observable, GroupError>,
{
    fn construct(&self, deps: &DependencyView, clock: &VirtualClock, track: &Tracker) -> Result<Observable, GroupError> {
        self(deps, clock, track)
    }
}

/// Boxes a closure as a shareable [`Definition`].
pub fn definition<F>(f: F) -> Rc<dyn Definition>
where
    F: Fn(&DependencyView, &VirtualClock, &Tracker) -> Result<Observable, GroupError> + 'static,
{
    Rc::new(f)
}

/// One node of the pipeline graph.
#[derive(Clone)]
pub struct Group {
    /// Stable identity
    pub id: GroupId,

    /// Name other groups reference it by
    pub name: String,

    /// Current position key
    pub position: PositionKey,

    /// The stream definition
    pub definition: Rc<dyn Definition>,

    /// Bumped on every definition change
    pub revision: u64,

    /// Set once the group is removed
    pub disposed: bool,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("position", &self.position)
            .field("revision", &self.revision)
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Ordered collection of live groups.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: Vec<Group>,
    removed: HashSet<GroupId>,
    next_seed: u64,
}

impl GroupRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a group after every existing one.
    pub fn add(&mut self, name: impl Into<String>, definition: Rc<dyn Definition>) -> GroupId {
        self.next_seed += 1;
        let id = GroupId::from_seed(self.next_seed);
        let position = match self.groups.last() {
            Some(last) => PositionKey(last.position.0.saturating_add(POSITION_STEP)),
            None => PositionKey(POSITION_STEP),
        };
        let name = name.into();
        debug!(group = %id, name = %name, position = position.0, "group added");
        self.groups.push(Group {
            id,
            name,
            position,
            definition,
            revision: 0,
            disposed: false,
        });
        id
    }

    /// Disposes a group and takes it out of the ordering.
    pub fn remove(&mut self, id: GroupId) -> Result<Group, GroupError> {
        let index = self.index_of(id).ok_or(GroupError::disposed(id))?;
        let mut group = self.groups.remove(index);
        group.disposed = true;
        self.removed.insert(id);
        debug!(group = %id, name = %group.name, "group removed");
        Ok(group)
    }

    /// Moves a group to `new_index` (clamped to the end).
    ///
    /// Only the moved group's key changes unless the target gap is exhausted,
    /// in which case the following groups are bumped until keys are unique again.
    pub fn reorder(&mut self, id: GroupId, new_index: usize) -> Result<(), GroupError> {
        let index = self.index_of(id).ok_or(GroupError::disposed(id))?;
        let mut group = self.groups.remove(index);
        let new_index = new_index.min(self.groups.len());

        let prev = new_index.checked_sub(1).map(|i| self.groups[i].position.0);
        let next = self.groups.get(new_index).map(|g| g.position.0);
        group.position = PositionKey(key_between(prev, next));
        self.groups.insert(new_index, group);

        let mut bumped = 0usize;
        for i in new_index + 1..self.groups.len() {
            let floor = self.groups[i - 1].position.0;
            if self.groups[i].position.0 > floor {
                break;
            }
            self.groups[i].position = PositionKey(floor + 1);
            bumped += 1;
        }

        debug!(group = %id, from = index, to = new_index, bumped, "group reordered");
        Ok(())
    }

    /// Renames a group, returning its previous name.
    pub fn rename(&mut self, id: GroupId, name: impl Into<String>) -> Result<String, GroupError> {
        let group = self.get_mut(id)?;
        Ok(std::mem::replace(&mut group.name, name.into()))
    }

    /// Replaces a group's definition, returning the new revision.
    pub fn set_definition(&mut self, id: GroupId, definition: Rc<dyn Definition>) -> Result<u64, GroupError> {
        let group = self.get_mut(id)?;
        group.definition = definition;
        group.revision += 1;
        Ok(group.revision)
    }

    /// Live group by id.
    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    fn get_mut(&mut self, id: GroupId) -> Result<&mut Group, GroupError> {
        self.groups.iter_mut().find(|g| g.id == id).ok_or(GroupError::disposed(id))
    }

    /// Index of a live group in position order.
    pub fn index_of(&self, id: GroupId) -> Option<usize> {
        self.groups.iter().position(|g| g.id == id)
    }

    /// Live groups in position order.
    pub fn ordered(&self) -> &[Group] {
        &self.groups
    }

    /// True if the group existed and has been removed.
    pub fn is_removed(&self, id: GroupId) -> bool {
        self.removed.contains(&id)
    }

    /// Number of live groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True if there are no live groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Key strictly after `prev` and, when the gap allows, strictly before `next`.
fn key_between(prev: Option<u64>, next: Option<u64>) -> u64 {
    let lower = prev.map_or(0, |p| p.saturating_add(1));
    match next {
        Some(upper) if upper > lower => lower + (upper - lower) / 2,
        Some(_) => lower,
        None => prev.map_or(POSITION_STEP, |p| p.saturating_add(POSITION_STEP)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn noop() -> Rc<dyn Definition> {
        definition(|_, _, _| Ok(Observable::empty()))
    }

    fn names(registry: &GroupRegistry) -> Vec<String> {
        registry.ordered().iter().map(|g| g.name.clone()).collect()
    }

    fn assert_strictly_increasing(registry: &GroupRegistry) {
        let keys: Vec<_> = registry.ordered().iter().map(|g| g.position).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys not increasing: {keys:?}");
    }

    #[test]
    fn test_add_keeps_insertion_order() {
        let mut registry = GroupRegistry::new();
        for name in ["A", "B", "C"] {
            registry.add(name, noop());
        }
        assert_eq!(names(&registry), vec!["A", "B", "C"]);
        assert_strictly_increasing(&registry);
    }

    #[test]
    fn test_reorder_moves_only_the_group() {
        let mut registry = GroupRegistry::new();
        let ids: Vec<_> = ["A", "B", "C", "D"].iter().map(|n| registry.add(*n, noop())).collect();
        let before: Vec<_> = registry.ordered().iter().map(|g| (g.id, g.position)).collect();

        registry.reorder(ids[3], 1).unwrap();

        assert_eq!(names(&registry), vec!["A", "D", "B", "C"]);
        for (id, key) in before.iter().take(3) {
            assert_eq!(registry.get(*id).unwrap().position, *key);
        }
        assert_strictly_increasing(&registry);
    }

    #[test]
    fn test_reorder_displaces_neighbours_when_gap_exhausted() {
        let mut registry = GroupRegistry::new();
        let ids: Vec<_> = ["A", "B", "C"].iter().map(|n| registry.add(*n, noop())).collect();

        // squeezing repeatedly between A and its successor exhausts the gap
        for _ in 0..20 {
            registry.reorder(ids[2], 1).unwrap();
            registry.reorder(ids[1], 1).unwrap();
        }

        assert_eq!(names(&registry), vec!["A", "B", "C"]);
        assert_strictly_increasing(&registry);
    }

    #[test]
    fn test_mutating_removed_group_is_disposed_access() {
        let mut registry = GroupRegistry::new();
        let a = registry.add("A", noop());
        let removed = registry.remove(a).unwrap();

        assert!(removed.disposed);
        assert!(registry.is_removed(a));
        assert_eq!(registry.rename(a, "Z"), Err(GroupError::disposed(a)));
        assert_eq!(registry.reorder(a, 0), Err(GroupError::disposed(a)));
        assert!(registry.remove(a).is_err());
    }

    #[test]
    fn test_set_definition_bumps_revision() {
        let mut registry = GroupRegistry::new();
        let a = registry.add("A", noop());
        assert_eq!(registry.set_definition(a, noop()), Ok(1));
        assert_eq!(registry.set_definition(a, noop()), Ok(2));
        assert_eq!(registry.rename(a, "B"), Ok("A".to_string()));
    }

    proptest! {
        #[test]
        fn prop_reorders_keep_keys_unique_and_unmoved_order(moves in prop::collection::vec((0usize..6, 0usize..6), 1..60)) {
            let mut registry = GroupRegistry::new();
            let ids: Vec<_> = (0..6).map(|i| registry.add(format!("g{i}"), noop())).collect();

            for (which, to) in moves {
                let moved = ids[which];
                let others_before: Vec<_> = registry.ordered().iter().map(|g| g.id).filter(|id| *id != moved).collect();
                registry.reorder(moved, to).unwrap();
                let others_after: Vec<_> = registry.ordered().iter().map(|g| g.id).filter(|id| *id != moved).collect();

                prop_assert_eq!(others_before, others_after);
                prop_assert_eq!(registry.index_of(moved), Some(to.min(5)));
                let keys: Vec<_> = registry.ordered().iter().map(|g| g.position).collect();
                prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
