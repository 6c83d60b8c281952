//! Dependency Visibility Resolver.
//!
//! A group may reference every group positioned strictly before it that holds
//! a successful stored history. When names repeat, the nearest one wins.
//! The visible set is rebuilt for every run and never cached.

use crate::history::History;
use crate::registry::GroupRegistry;
use crate::store::{replay, HistoryStore};
use crate::stream::Observable;
use marbles_env::{GroupError, GroupId, VirtualClock};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// One referenceable upstream group.
#[derive(Debug, Clone)]
pub struct VisibleEntry {
    /// Name it is referenced by
    pub name: String,

    /// Owning group
    pub group: GroupId,

    /// Store generation of the history below
    pub generation: u64,

    /// Last successful root history
    pub history: Arc<History>,
}

/// Name-indexed upstream outputs visible to one group, in position order of
/// the winning entries.
#[derive(Debug, Clone, Default)]
pub struct VisibleSet {
    entries: Vec<VisibleEntry>,
}

impl VisibleSet {
    /// Entry for `name`, if visible.
    pub fn get(&self, name: &str) -> Option<&VisibleEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Visible names.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// All entries.
    pub fn entries(&self) -> &[VisibleEntry] {
        &self.entries
    }

    /// Number of visible names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is visible.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: VisibleEntry) {
        // a later (nearer) group shadows an earlier one of the same name
        self.entries.retain(|e| e.name != entry.name);
        self.entries.push(entry);
    }
}

/// Computes the set visible to `target`.
pub fn resolve(registry: &GroupRegistry, store: &HistoryStore, target: GroupId) -> Result<VisibleSet, GroupError> {
    if registry.get(target).is_none() {
        return Err(GroupError::disposed(target));
    }

    let mut visible = VisibleSet::default();
    for group in registry.ordered() {
        if group.id == target {
            break;
        }
        if group.disposed {
            continue;
        }
        if let Some(slot) = store.get(group.id) {
            visible.insert(VisibleEntry {
                name: group.name.clone(),
                group: group.id,
                generation: slot.generation,
                history: slot.history.clone(),
            });
        }
    }
    Ok(visible)
}

/// What one lookup through a [`DependencyView`] resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyAccess {
    /// Requested name
    pub name: String,

    /// Owning group and store generation, or `None` if the name was not visible
    pub resolved: Option<(GroupId, u64)>,
}

/// Read-only view of a group's dependencies for one run.
///
/// Every lookup is logged so that the result of the run can be reused only
/// while the same lookups keep resolving the same way. Enumerating the names
/// makes the run depend on the whole visible set.
#[derive(Debug)]
pub struct DependencyView {
    visible: VisibleSet,
    clock: VirtualClock,
    accesses: RefCell<Vec<DependencyAccess>>,
    listed: Cell<bool>,
}

impl DependencyView {
    /// Creates a view replaying `visible` on `clock`.
    pub fn new(visible: VisibleSet, clock: &VirtualClock) -> Self {
        Self {
            visible,
            clock: clock.clone(),
            accesses: RefCell::new(Vec::new()),
            listed: Cell::new(false),
        }
    }

    /// A view with nothing visible.
    pub fn empty(clock: &VirtualClock) -> Self {
        Self::new(VisibleSet::default(), clock)
    }

    /// Replay of the upstream history named `name`.
    ///
    /// Fails with [`GroupError::DependencyLookup`] if the name is not visible.
    pub fn get(&self, name: &str) -> Result<Observable, GroupError> {
        match self.lookup(name) {
            Some(entry) => Ok(replay(&entry.history, &self.clock)),
            None => Err(GroupError::lookup(name)),
        }
    }

    /// True if `name` is visible.
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Visible names in position order.
    pub fn names(&self) -> Vec<String> {
        self.listed.set(true);
        self.visible.names()
    }

    /// Lookups performed so far.
    pub fn accesses(&self) -> Vec<DependencyAccess> {
        self.accesses.borrow().clone()
    }

    /// Snapshot of the whole visible set if [`names`](Self::names) was called.
    pub fn listing(&self) -> Option<Vec<DependencyAccess>> {
        self.listed.get().then(|| snapshot(&self.visible))
    }

    fn lookup(&self, name: &str) -> Option<&VisibleEntry> {
        let entry = self.visible.get(name);
        self.accesses.borrow_mut().push(DependencyAccess {
            name: name.to_string(),
            resolved: entry.map(|e| (e.group, e.generation)),
        });
        entry
    }
}

/// `(name, group, generation)` of every visible entry.
pub fn snapshot(visible: &VisibleSet) -> Vec<DependencyAccess> {
    visible
        .entries()
        .iter()
        .map(|e| DependencyAccess {
            name: e.name.clone(),
            resolved: Some((e.group, e.generation)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::definition;

    fn history(name: &str) -> Arc<History> {
        Arc::new(History {
            name: name.into(),
            start_time: 0,
            end_time: Some(0),
            events: Vec::new(),
            error: None,
        })
    }

    fn setup(names: &[&str]) -> (GroupRegistry, HistoryStore, Vec<GroupId>) {
        let mut registry = GroupRegistry::new();
        let mut store = HistoryStore::new();
        let ids: Vec<_> = names
            .iter()
            .map(|name| {
                let id = registry.add(*name, definition(|_, _, _| Ok(Observable::empty())));
                store.put(id, history(name));
                id
            })
            .collect();
        (registry, store, ids)
    }

    #[test]
    fn test_only_earlier_groups_are_visible() {
        let (registry, store, ids) = setup(&["A", "B", "C"]);
        assert_eq!(resolve(&registry, &store, ids[0]).unwrap().names(), Vec::<String>::new());
        assert_eq!(resolve(&registry, &store, ids[2]).unwrap().names(), vec!["A", "B"]);
    }

    #[test]
    fn test_groups_without_output_are_invisible() {
        let (registry, mut store, ids) = setup(&["A", "B", "C"]);
        store.clear(ids[0]);
        assert_eq!(resolve(&registry, &store, ids[2]).unwrap().names(), vec!["B"]);
    }

    #[test]
    fn test_nearest_duplicate_wins() {
        let (registry, store, ids) = setup(&["X", "A", "X", "B"]);
        let visible = resolve(&registry, &store, ids[3]).unwrap();
        assert_eq!(visible.names(), vec!["A", "X"]);
        assert_eq!(visible.get("X").map(|e| e.group), Some(ids[2]));
    }

    #[test]
    fn test_removed_target_is_disposed_access() {
        let (mut registry, store, ids) = setup(&["A"]);
        registry.remove(ids[0]).unwrap();
        assert_eq!(resolve(&registry, &store, ids[0]).unwrap_err(), GroupError::disposed(ids[0]));
    }

    #[test]
    fn test_view_logs_lookups() {
        let (registry, store, ids) = setup(&["A", "B"]);
        let clock = VirtualClock::new();
        let view = DependencyView::new(resolve(&registry, &store, ids[1]).unwrap(), &clock);

        assert!(view.get("A").is_ok());
        assert_eq!(view.get("B").unwrap_err(), GroupError::lookup("B"));
        assert_eq!(
            view.accesses(),
            vec![
                DependencyAccess {
                    name: "A".into(),
                    resolved: Some((ids[0], store.generation(ids[0]).unwrap())),
                },
                DependencyAccess {
                    name: "B".into(),
                    resolved: None,
                },
            ]
        );
        assert_eq!(view.listing(), None);
        assert_eq!(view.names(), vec!["A"]);
        assert_eq!(view.listing().map(|l| l.len()), Some(1));
    }
}
