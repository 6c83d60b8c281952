//! Virtual Clock Evaluation Driver.
//!
//! One run of one group: fresh clock, dependency view, definition, root
//! tracking, flush to the horizon, harvest. Every failure is contained here
//! and turned into an empty [`GroupRun`] carrying the error.

use crate::config::EngineConfig;
use crate::history::History;
use crate::registry::Group;
use crate::resolver::{DependencyAccess, DependencyView, VisibleSet};
use crate::tracking::TrackingSession;
use marbles_env::{EventId, EventIdGenerator, GroupError, VirtualClock, VirtualTime};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one evaluation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRun {
    /// Root history first, then every other history in creation order.
    /// Empty when the run failed.
    pub histories: Vec<Arc<History>>,

    /// Why the run produced nothing
    pub error: Option<GroupError>,

    /// Dependency lookups performed by the definition
    pub accesses: Vec<DependencyAccess>,

    /// Whole visible set at run time, if the definition enumerated it
    pub listing: Option<Vec<DependencyAccess>>,

    /// Id the run's first event got (or would have got)
    pub first_event_id: EventId,

    /// Clock time after the flush
    pub final_time: VirtualTime,

    /// True if scheduled work beyond the horizon was discarded
    pub hit_horizon: bool,
}

impl GroupRun {
    /// A run that produced nothing and reported nothing.
    pub fn empty(first_event_id: EventId) -> Self {
        Self {
            histories: Vec::new(),
            error: None,
            accesses: Vec::new(),
            listing: None,
            first_event_id,
            final_time: 0,
            hit_horizon: false,
        }
    }

    /// An empty run reporting `error`.
    pub fn failed(first_event_id: EventId, error: GroupError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(first_event_id)
        }
    }

    /// The root history, present iff the run succeeded.
    pub fn root(&self) -> Option<&Arc<History>> {
        self.histories.first()
    }

    /// True if the run produced a root history.
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && !self.histories.is_empty()
    }

    /// Histories with ids rebased to the run's first id, for comparing runs.
    pub fn canonical_histories(&self) -> Vec<History> {
        self.histories.iter().map(|h| h.rebased(self.first_event_id)).collect()
    }
}

/// Evaluates `group` against the upstream outputs in `visible`.
pub fn evaluate(group: &Group, visible: VisibleSet, config: &EngineConfig, ids: &EventIdGenerator) -> GroupRun {
    let first_event_id = ids.peek();
    if group.disposed {
        return GroupRun::empty(first_event_id);
    }

    let clock = VirtualClock::with_horizon(config.horizon);
    let view = DependencyView::new(visible, &clock);
    let session = TrackingSession::new(&clock, ids, config.event_cap);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let stream = group.definition.construct(&view, &clock, &session.tracker())?;
        let root = session.subscribe_root(&stream, &group.name);
        let flushed = clock.flush();
        Ok::<_, GroupError>((root, flushed))
    }));

    // Stopping runs user teardowns, which may panic as well
    let (histories, outcome) = match catch_unwind(AssertUnwindSafe(|| session.finish())) {
        Ok(histories) => (histories, outcome),
        Err(payload) => {
            let outcome = match outcome {
                Ok(Ok(_)) => Err(payload),
                earlier => earlier,
            };
            (Vec::new(), outcome)
        }
    };
    let accesses = view.accesses();
    let listing = view.listing();

    let result = match outcome {
        Ok(Ok((root, flushed))) => match histories.get(root.0) {
            Some(history) => match &history.error {
                Some(message) => Err(GroupError::runtime(message.clone())),
                None => Ok((root, flushed)),
            },
            None => Err(GroupError::runtime("root history missing")),
        },
        Ok(Err(e)) => Err(e),
        Err(payload) => Err(GroupError::runtime(panic_message(payload.as_ref()))),
    };

    match result {
        Ok((root, flushed)) => {
            let mut ordered = Vec::with_capacity(histories.len());
            ordered.push(histories[root.0].clone());
            ordered.extend(
                histories
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != root.0)
                    .map(|(_, h)| h.clone()),
            );

            debug!(
                group = %group.id,
                name = %group.name,
                events = ordered[0].len(),
                histories = ordered.len(),
                final_time = clock.now(),
                hit_horizon = flushed.hit_horizon,
                "group evaluated"
            );

            GroupRun {
                histories: ordered,
                error: None,
                accesses,
                listing,
                first_event_id,
                final_time: clock.now(),
                hit_horizon: flushed.hit_horizon,
            }
        }
        Err(error) => {
            warn!(group = %group.id, name = %group.name, kind = error.kind(), error = %error, "group evaluation failed");
            GroupRun {
                accesses,
                listing,
                final_time: clock.now(),
                ..GroupRun::failed(first_event_id, error)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in user code".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{definition, Definition, PositionKey};
    use crate::stream::{Observable, Value};
    use marbles_env::GroupId;
    use serde_json::json;
    use std::rc::Rc;

    fn group(name: &str, def: Rc<dyn Definition>) -> Group {
        Group {
            id: GroupId::from_seed(1),
            name: name.into(),
            position: PositionKey(1),
            definition: def,
            revision: 0,
            disposed: false,
        }
    }

    fn run(def: Rc<dyn Definition>) -> GroupRun {
        evaluate(&group("G", def), VisibleSet::default(), &EngineConfig::default(), &EventIdGenerator::new())
    }

    #[test]
    fn test_successful_run_returns_root_first() {
        let result = run(definition(|_, _, _| Ok(Observable::of([1, 2, 3]))));

        assert!(result.is_ok());
        let root = result.root().unwrap();
        assert_eq!(root.name, "G");
        assert_eq!(root.timed_values(), vec![(0, json!(1)), (0, json!(2)), (0, json!(3))]);
        assert_eq!(root.end_time, Some(0));
    }

    #[test]
    fn test_constructor_error_gives_empty_result() {
        let result = run(definition(|_, _, _| Err(GroupError::constructor("bad input"))));

        assert!(result.histories.is_empty());
        assert_eq!(result.error, Some(GroupError::constructor("bad input")));
    }

    #[test]
    fn test_missing_dependency_propagates_lookup_error() {
        let result = run(definition(|deps, _, _| deps.get("A")));
        assert_eq!(result.error, Some(GroupError::lookup("A")));
        assert_eq!(result.accesses.len(), 1);
    }

    #[test]
    fn test_stream_error_becomes_runtime_error() {
        let result = run(definition(|_, _, _| Ok(Observable::throw_error("exploded"))));
        assert_eq!(result.error, Some(GroupError::runtime("exploded")));
        assert!(result.histories.is_empty());
    }

    #[test]
    fn test_panic_in_definition_is_contained() {
        let result = run(definition(|_, _, _| panic!("definition blew up")));
        assert_eq!(result.error, Some(GroupError::runtime("definition blew up")));
    }

    #[test]
    fn test_panic_during_flush_is_contained() {
        let result = run(definition(|_, clock, _| {
            Ok(Observable::interval(clock, 5).map(|v| {
                if v.as_i64() == Some(3) {
                    panic!("tick {}", 3);
                }
                v
            }))
        }));
        assert_eq!(result.error, Some(GroupError::runtime("tick 3")));
        assert_eq!(result.final_time, 20);
    }

    #[test]
    fn test_panic_in_teardown_is_contained() {
        let result = run(definition(|_, _, _| {
            Ok(Observable::new(|sub| {
                sub.add_teardown(|| panic!("teardown blew up"));
                sub.next(1.into());
            }))
        }));
        assert_eq!(result.error, Some(GroupError::runtime("teardown blew up")));
        assert!(result.histories.is_empty());
    }

    #[test]
    fn test_earlier_error_wins_over_teardown_panic() {
        let result = run(definition(|_, clock, _| {
            let clock = clock.clone();
            Ok(Observable::new(move |sub| {
                sub.add_teardown(|| panic!("teardown blew up"));
                clock.schedule(5, || panic!("tick blew up"));
            }))
        }));
        assert_eq!(result.error, Some(GroupError::runtime("tick blew up")));
        assert_eq!(result.final_time, 5);
    }

    #[test]
    fn test_disposed_group_is_not_evaluated() {
        let mut g = group("G", definition(|_, _, _| panic!("must not run")));
        g.disposed = true;
        let result = evaluate(&g, VisibleSet::default(), &EngineConfig::default(), &EventIdGenerator::new());
        assert_eq!(result, GroupRun::empty(EventId(0)));
    }

    #[test]
    fn test_horizon_stops_endless_schedules() {
        let config = EngineConfig::default().with_horizon(100);
        let g = group("G", definition(|_, clock, _| Ok(Observable::timer(clock, 500))));
        let result = evaluate(&g, VisibleSet::default(), &config, &EventIdGenerator::new());

        assert!(result.is_ok());
        assert!(result.hit_horizon);
        assert!(result.root().unwrap().is_empty());
        assert_eq!(result.root().unwrap().end_time, None);
    }

    #[test]
    fn test_user_tracked_histories_follow_root() {
        let result = run(definition(|_, _, track| {
            let inner = track.track(&Observable::of([5]), "inner");
            Ok(inner.map(|v| Value::from(v.as_i64().unwrap_or(0) * 2)))
        }));

        let names: Vec<_> = result.histories.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["G", "inner"]);
        assert_eq!(result.root().unwrap().values(), vec![&json!(10)]);
    }

    #[test]
    fn test_canonical_histories_are_id_independent() {
        let def = definition(|_, clock, _| Ok(Observable::interval(clock, 3).take(4)));
        let ids = EventIdGenerator::starting_at(1000);
        let g = group("G", def);
        let first = evaluate(&g, VisibleSet::default(), &EngineConfig::default(), &ids);
        let second = evaluate(&g, VisibleSet::default(), &EngineConfig::default(), &ids);

        assert_ne!(first.histories, second.histories);
        assert_eq!(first.canonical_histories(), second.canonical_histories());
    }
}
