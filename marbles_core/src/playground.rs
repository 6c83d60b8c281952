//! The engine facade: registry, store and a memoized run per group.
//!
//! Recomputation is pull-based. A cached run records its inputs (definition
//! revision plus every dependency lookup with the store generation it saw) and
//! is reused only while those inputs resolve identically. Removing, renaming or
//! redefining a group additionally drops, right away, the cached runs of every
//! group that looked that name up.

use crate::config::EngineConfig;
use crate::driver::{self, GroupRun};
use crate::history::History;
use crate::registry::{Definition, GroupRegistry, PositionKey};
use crate::resolver::{resolve, snapshot, DependencyView};
use crate::store::HistoryStore;
use crate::stream::Observable;
use crate::tracking::Tracker;
use marbles_env::{EventIdGenerator, GroupError, GroupId, VirtualClock};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

/// Ordered snapshot entry of a live group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group id
    pub id: GroupId,

    /// Current name
    pub name: String,

    /// Current position key
    pub position: PositionKey,

    /// Definition revision
    pub revision: u64,
}

#[derive(Debug, Clone)]
struct CachedRun {
    revision: u64,
    run: GroupRun,
}

impl CachedRun {
    fn mentions(&self, name: &str) -> bool {
        self.run.listing.is_some() || self.run.accesses.iter().any(|a| a.name == name)
    }
}

/// A set of interdependent groups evaluated on demand.
#[derive(Debug)]
pub struct Playground {
    registry: GroupRegistry,
    store: HistoryStore,
    ids: EventIdGenerator,
    config: EngineConfig,
    cache: HashMap<GroupId, CachedRun>,
    runs_executed: u64,
}

impl Default for Playground {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Playground {
    /// Creates an empty playground with its own id generator.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_ids(config, EventIdGenerator::new())
    }

    /// Creates an empty playground drawing event ids from `ids`.
    pub fn with_ids(config: EngineConfig, ids: EventIdGenerator) -> Self {
        Self {
            registry: GroupRegistry::new(),
            store: HistoryStore::new(),
            ids,
            config,
            cache: HashMap::new(),
            runs_executed: 0,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of driver runs so far (cache hits excluded).
    pub fn runs_executed(&self) -> u64 {
        self.runs_executed
    }

    /// Appends a group defined by a closure.
    pub fn add<F>(&mut self, name: impl Into<String>, definition: F) -> GroupId
    where
        F: Fn(&DependencyView, &VirtualClock, &Tracker) -> Result<Observable, GroupError> + 'static,
    {
        self.add_shared(name, Rc::new(definition))
    }

    /// Appends a group with an already shared definition.
    pub fn add_shared(&mut self, name: impl Into<String>, definition: Rc<dyn Definition>) -> GroupId {
        self.registry.add(name, definition)
    }

    /// Removes a group, erasing its stored output.
    pub fn remove(&mut self, id: GroupId) -> Result<(), GroupError> {
        let group = self.registry.remove(id)?;
        self.store.clear(id);
        self.cache.remove(&id);
        self.invalidate_name(&group.name);
        info!(group = %id, name = %group.name, "group disposed");
        Ok(())
    }

    /// Moves a group to `new_index` in the ordering.
    pub fn reorder(&mut self, id: GroupId, new_index: usize) -> Result<(), GroupError> {
        self.registry.reorder(id, new_index)
    }

    /// Replaces a group's definition with a closure.
    pub fn set_definition<F>(&mut self, id: GroupId, definition: F) -> Result<(), GroupError>
    where
        F: Fn(&DependencyView, &VirtualClock, &Tracker) -> Result<Observable, GroupError> + 'static,
    {
        self.set_shared_definition(id, Rc::new(definition))
    }

    /// Replaces a group's definition.
    pub fn set_shared_definition(&mut self, id: GroupId, definition: Rc<dyn Definition>) -> Result<(), GroupError> {
        self.registry.set_definition(id, definition)?;
        self.cache.remove(&id);
        if let Some(name) = self.registry.get(id).map(|g| g.name.clone()) {
            self.invalidate_name(&name);
        }
        Ok(())
    }

    /// Renames a group.
    pub fn rename(&mut self, id: GroupId, name: impl Into<String>) -> Result<(), GroupError> {
        let name = name.into();
        let old = self.registry.rename(id, name.clone())?;
        self.invalidate_name(&old);
        self.invalidate_name(&name);
        Ok(())
    }

    /// Result of the group's last run, recomputing whatever is stale.
    ///
    /// Every group positioned before `id` is brought up to date first.
    /// A removed or unknown group yields an empty run.
    pub fn evaluate(&mut self, id: GroupId) -> GroupRun {
        if self.registry.get(id).is_none() {
            return GroupRun::empty(self.ids.peek());
        }
        self.refresh_upstream(id);
        self.refresh(id);
        self.cache
            .get(&id)
            .map(|cached| cached.run.clone())
            .unwrap_or_else(|| GroupRun::empty(self.ids.peek()))
    }

    /// Evaluates every group in position order.
    pub fn evaluate_all(&mut self) -> Vec<(GroupId, GroupRun)> {
        let order: Vec<GroupId> = self.registry.ordered().iter().map(|g| g.id).collect();
        order.into_iter().map(|id| (id, self.evaluate(id))).collect()
    }

    /// Names currently visible to `id`, without running `id` itself.
    pub fn visible_names(&mut self, id: GroupId) -> Result<Vec<String>, GroupError> {
        if self.registry.get(id).is_none() {
            return Err(GroupError::disposed(id));
        }
        self.refresh_upstream(id);
        Ok(resolve(&self.registry, &self.store, id)?.names())
    }

    /// Histories of the group's last run, root first.
    pub fn histories(&mut self, id: GroupId) -> Vec<Arc<History>> {
        self.evaluate(id).histories
    }

    /// The group's current error, if its last run failed.
    pub fn error(&mut self, id: GroupId) -> Option<GroupError> {
        self.evaluate(id).error
    }

    /// Live groups in position order.
    pub fn groups(&self) -> Vec<GroupInfo> {
        self.registry
            .ordered()
            .iter()
            .map(|g| GroupInfo {
                id: g.id,
                name: g.name.clone(),
                position: g.position,
                revision: g.revision,
            })
            .collect()
    }

    /// Last successful root history in the store, without recomputing.
    pub fn stored_history(&self, id: GroupId) -> Option<Arc<History>> {
        self.store.get(id).map(|slot| slot.history.clone())
    }

    fn refresh_upstream(&mut self, id: GroupId) {
        let upstream: Vec<GroupId> = self
            .registry
            .ordered()
            .iter()
            .map(|g| g.id)
            .take_while(|g| *g != id)
            .collect();
        for group in upstream {
            self.refresh(group);
        }
    }

    fn refresh(&mut self, id: GroupId) {
        let Some(group) = self.registry.get(id).cloned() else {
            return;
        };
        let visible = match resolve(&self.registry, &self.store, id) {
            Ok(visible) => visible,
            Err(e) => {
                self.cache.insert(
                    id,
                    CachedRun {
                        revision: group.revision,
                        run: GroupRun::failed(self.ids.peek(), e),
                    },
                );
                return;
            }
        };

        if let Some(cached) = self.cache.get(&id) {
            let listing_holds = cached
                .run
                .listing
                .as_ref()
                .map_or(true, |listing| *listing == snapshot(&visible));
            let lookups_hold = cached
                .run
                .accesses
                .iter()
                .all(|a| visible.get(&a.name).map(|e| (e.group, e.generation)) == a.resolved);
            if cached.revision == group.revision && listing_holds && lookups_hold {
                return;
            }
        }

        let run = driver::evaluate(&group, visible, &self.config, &self.ids);
        self.runs_executed += 1;
        match run.root() {
            Some(root) if run.error.is_none() => {
                let generation = self.store.put(id, root.clone());
                debug!(group = %id, generation, "stored new output");
            }
            _ => {
                self.store.clear(id);
            }
        }
        self.cache.insert(
            id,
            CachedRun {
                revision: group.revision,
                run,
            },
        );
    }

    fn invalidate_name(&mut self, name: &str) {
        let before = self.cache.len();
        self.cache.retain(|_, cached| !cached.mentions(name));
        let dropped = before - self.cache.len();
        if dropped > 0 {
            debug!(name, dropped, "invalidated dependents");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Value;
    use marbles_env::EventId;
    use serde_json::json;
    use std::cell::Cell;

    fn double(v: Value) -> Value {
        Value::from(v.as_i64().unwrap_or(0) * 2)
    }

    fn scenario_ab(pg: &mut Playground) -> (GroupId, GroupId) {
        let a = pg.add("A", |_, _, _| Ok(Observable::of([1, 2, 3])));
        let b = pg.add("B", |deps, _, _| Ok(deps.get("A")?.map(double)));
        (a, b)
    }

    #[test]
    fn test_scenario_a_emit_then_complete() {
        let mut pg = Playground::default();
        let (a, _) = scenario_ab(&mut pg);
        let run = pg.evaluate(a);

        let root = run.root().unwrap();
        assert_eq!(root.timed_values(), vec![(0, json!(1)), (0, json!(2)), (0, json!(3))]);
        assert_eq!(root.start_time, 0);
        assert_eq!(root.end_time, Some(0));
    }

    #[test]
    fn test_scenario_b_replay_and_double() {
        let mut pg = Playground::default();
        let (_, b) = scenario_ab(&mut pg);
        let run = pg.evaluate(b);

        assert_eq!(run.error, None);
        let root = run.root().unwrap();
        assert_eq!(root.timed_values(), vec![(0, json!(2)), (0, json!(4)), (0, json!(6))]);
        assert_eq!(root.end_time, Some(0));
    }

    #[test]
    fn test_scenario_c_disposed_upstream() {
        let mut pg = Playground::default();
        let (a, b) = scenario_ab(&mut pg);
        assert!(pg.evaluate(b).is_ok());

        pg.remove(a).unwrap();
        let run = pg.evaluate(b);

        assert_eq!(run.error, Some(GroupError::lookup("A")));
        assert!(run.histories.is_empty());
        assert!(pg.stored_history(b).is_none());
        assert_eq!(pg.remove(a), Err(GroupError::disposed(a)));
    }

    #[test]
    fn test_event_cap_truncates_without_end_time() {
        let mut pg = Playground::default();
        let g = pg.add("many", |_, _, _| Ok(Observable::range(0, 250)));
        let root = pg.evaluate(g).root().cloned().unwrap();

        assert_eq!(root.len(), 100);
        assert_eq!(root.end_time, None);
        assert_eq!(pg.error(g), None);
    }

    #[test]
    fn test_configurable_cap() {
        let mut pg = Playground::new(EngineConfig::default().with_event_cap(7));
        let g = pg.add("ticks", |_, clock, _| Ok(Observable::interval(clock, 1)));
        assert_eq!(pg.evaluate(g).root().unwrap().len(), 7);
    }

    #[test]
    fn test_three_inner_streams_nest() {
        let mut pg = Playground::default();
        let g = pg.add("outer", |_, clock, _| {
            let clock = clock.clone();
            Ok(Observable::of([1, 2, 3]).map(move |v| {
                let n = v.as_i64().unwrap_or(0) as u64;
                Value::Stream(Observable::interval(&clock, n).take(2))
            }))
        });
        let run = pg.evaluate(g);

        let root = run.root().unwrap();
        assert_eq!(root.len(), 3);
        let nested: Vec<_> = root.nested().collect();
        assert_eq!(nested.len(), 3);
        for (i, inner) in nested.iter().enumerate() {
            let n = i as u64 + 1;
            assert_eq!(inner.name, format!("outer[{i}]"));
            assert_eq!(inner.start_time, 0);
            assert_eq!(inner.timed_values(), vec![(n, json!(0)), (2 * n, json!(1))]);
            assert_eq!(inner.end_time, Some(2 * n));
        }
        assert_eq!(run.histories.len(), 4);
    }

    #[test]
    fn test_rerun_is_deterministic() {
        let build = |pg: &mut Playground| {
            pg.add("src", |_, clock, _| Ok(Observable::interval(clock, 7).take(5)));
            pg.add("sum", |deps, _, _| {
                Ok(deps
                    .get("src")?
                    .scan(0, |acc, v| Value::from(acc.as_i64().unwrap_or(0) + v.as_i64().unwrap_or(0))))
            })
        };

        let ids = EventIdGenerator::new();
        let mut first = Playground::with_ids(EngineConfig::default(), ids.clone());
        let mut second = Playground::with_ids(EngineConfig::default(), ids);
        let (g1, g2) = (build(&mut first), build(&mut second));
        let (r1, r2) = (first.evaluate(g1), second.evaluate(g2));

        assert_eq!(r1.canonical_histories(), r2.canonical_histories());
        assert!(r1.first_event_id < r2.first_event_id);
    }

    #[test]
    fn test_ids_increase_across_groups_and_runs() {
        let mut pg = Playground::default();
        let (a, b) = scenario_ab(&mut pg);
        let first = pg.evaluate(b);
        pg.set_definition(a, |_, _, _| Ok(Observable::of([4, 5]))).unwrap();
        let second = pg.evaluate(b);

        assert_eq!(first.root().unwrap().all_ids(), vec![EventId(3), EventId(4), EventId(5)]);
        assert_eq!(pg.stored_history(a).unwrap().all_ids(), vec![EventId(6), EventId(7)]);
        assert_eq!(second.root().unwrap().all_ids(), vec![EventId(8), EventId(9)]);
    }

    #[test]
    fn test_later_group_is_not_visible() {
        let mut pg = Playground::default();
        let early = pg.add("early", |deps, _, _| deps.get("late"));
        let late = pg.add("late", |_, _, _| Ok(Observable::of([1])));

        assert_eq!(pg.evaluate(early).error, Some(GroupError::lookup("late")));
        assert!(pg.evaluate(late).is_ok());
        // still failing once "late" has an output
        assert_eq!(pg.evaluate(early).error, Some(GroupError::lookup("late")));
        assert_eq!(pg.visible_names(late).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_nearest_duplicate_name_wins() {
        let mut pg = Playground::default();
        pg.add("X", |_, _, _| Ok(Observable::of([1])));
        pg.add("X", |_, _, _| Ok(Observable::of([2])));
        let reader = pg.add("reader", |deps, _, _| deps.get("X"));

        assert_eq!(pg.evaluate(reader).root().unwrap().values(), vec![&json!(2)]);
        assert_eq!(pg.visible_names(reader).unwrap(), vec!["X"]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let mut pg = Playground::default();
        let ok = pg.add("ok", |_, _, _| Ok(Observable::of([1])));
        let bad = pg.add("bad", |_, _, _| Err(GroupError::constructor("syntax error")));
        let boom = pg.add("boom", |_, _, _| -> Result<Observable, GroupError> { panic!("boom") });
        let after = pg.add("after", |deps, _, _| deps.get("ok"));
        let reader = pg.add("reader", |deps, _, _| deps.get("bad"));

        let results: HashMap<_, _> = pg.evaluate_all().into_iter().collect();
        assert!(results[&ok].is_ok());
        assert_eq!(results[&bad].error, Some(GroupError::constructor("syntax error")));
        assert_eq!(results[&boom].error, Some(GroupError::runtime("boom")));
        assert!(results[&after].is_ok());
        assert_eq!(results[&reader].error, Some(GroupError::lookup("bad")));
        assert_eq!(pg.visible_names(reader).unwrap(), vec!["ok", "after"]);
    }

    #[test]
    fn test_teardown_panic_clears_stored_output() {
        let mut pg = Playground::default();
        let a = pg.add("A", |_, _, _| Ok(Observable::of([1, 2])));
        let b = pg.add("B", |deps, _, _| deps.get("A"));
        assert!(pg.evaluate(b).is_ok());

        pg.set_definition(a, |_, _, _| {
            Ok(Observable::new(|sub| {
                sub.add_teardown(|| panic!("teardown blew up"));
                sub.next(1.into());
            }))
        })
        .unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pg.evaluate(b)));
        let run_b = outcome.expect("panic escaped the playground");
        assert_eq!(run_b.error, Some(GroupError::lookup("A")));
        assert_eq!(pg.error(a), Some(GroupError::runtime("teardown blew up")));
        assert!(pg.stored_history(a).is_none());
    }

    #[test]
    fn test_runtime_stream_error_is_reported() {
        let mut pg = Playground::default();
        let g = pg.add("g", |_, clock, _| {
            Ok(Observable::timer(clock, 5).try_map(|_| Err(crate::stream::StreamError::new("bad tick"))))
        });
        assert_eq!(pg.error(g), Some(GroupError::runtime("bad tick")));
        assert!(pg.histories(g).is_empty());
    }

    #[test]
    fn test_unchanged_inputs_reuse_cached_run() {
        let calls = Rc::new(Cell::new(0u32));
        let counter = calls.clone();
        let mut pg = Playground::default();
        let (a, _) = scenario_ab(&mut pg);
        let c = pg.add("C", move |deps, _, _| {
            counter.set(counter.get() + 1);
            deps.get("B")
        });

        let first = pg.evaluate(c);
        let second = pg.evaluate(c);
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        assert_eq!(pg.runs_executed(), 3);

        // moving a group onto its own slot keeps every input
        pg.reorder(c, 2).unwrap();
        pg.evaluate(c);
        assert_eq!(calls.get(), 1);

        pg.set_definition(a, |_, _, _| Ok(Observable::of([10]))).unwrap();
        let third = pg.evaluate(c);
        assert_eq!(calls.get(), 2);
        assert_eq!(third.root().unwrap().values(), vec![&json!(20)]);
    }

    #[test]
    fn test_reorder_changes_visibility() {
        let mut pg = Playground::default();
        let (a, b) = scenario_ab(&mut pg);
        assert!(pg.evaluate(b).is_ok());

        pg.reorder(b, 0).unwrap();
        assert_eq!(pg.evaluate(b).error, Some(GroupError::lookup("A")));

        pg.reorder(a, 0).unwrap();
        assert!(pg.evaluate(b).is_ok());
    }

    #[test]
    fn test_rename_invalidates_readers() {
        let mut pg = Playground::default();
        let (a, b) = scenario_ab(&mut pg);
        assert!(pg.evaluate(b).is_ok());

        pg.rename(a, "Renamed").unwrap();
        assert_eq!(pg.evaluate(b).error, Some(GroupError::lookup("A")));
        assert_eq!(pg.groups()[0].name, "Renamed");
    }

    #[test]
    fn test_removed_group_evaluates_empty() {
        let mut pg = Playground::default();
        let (a, _) = scenario_ab(&mut pg);
        pg.remove(a).unwrap();

        let run = pg.evaluate(a);
        assert!(run.histories.is_empty());
        assert_eq!(run.error, None);
        assert_eq!(pg.visible_names(a), Err(GroupError::disposed(a)));
        assert_eq!(pg.rename(a, "again"), Err(GroupError::disposed(a)));
    }
}
