//! History & Replay Store.
//!
//! One slot per group holding its last successful root [`History`]. Every write
//! gets a fresh generation number so readers can tell whether the slot they
//! depended on has changed since.

use crate::history::{History, Payload};
use crate::stream::{Observable, Value};
use marbles_env::{GroupId, VirtualClock};
use std::collections::HashMap;
use std::sync::Arc;

/// A stored root history and the generation it was written at.
#[derive(Debug, Clone)]
pub struct StoreSlot {
    /// Last successful root history
    pub history: Arc<History>,

    /// Store-wide write counter value of this write
    pub generation: u64,
}

/// Per-group slots of successful outputs.
#[derive(Debug, Default)]
pub struct HistoryStore {
    slots: HashMap<GroupId, StoreSlot>,
    next_generation: u64,
}

impl HistoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the slot of `group`, returning the new generation.
    pub fn put(&mut self, group: GroupId, history: Arc<History>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.slots.insert(group, StoreSlot { history, generation });
        generation
    }

    /// The slot of `group`, if it holds a successful output.
    pub fn get(&self, group: GroupId) -> Option<&StoreSlot> {
        self.slots.get(&group)
    }

    /// Empties the slot of `group`. Returns true if it held something.
    pub fn clear(&mut self, group: GroupId) -> bool {
        self.slots.remove(&group).is_some()
    }

    /// Generation of the slot of `group`.
    pub fn generation(&self, group: GroupId) -> Option<u64> {
        self.slots.get(&group).map(|slot| slot.generation)
    }

    /// Number of filled slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no slot is filled.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Replays `history` on `clock`.
///
/// Each event is re-emitted `event.time - history.start_time` frames after
/// subscription; the stream completes at the recorded end offset, or never if
/// the history has no end time. Nested histories come back as nested streams
/// replaying the same way.
pub fn replay(history: &Arc<History>, clock: &VirtualClock) -> Observable {
    let start = history.start_time;
    let entries: Vec<_> = history
        .events
        .iter()
        .map(|event| {
            let value = match &event.payload {
                Payload::Value(v) => Value::Data(v.clone()),
                Payload::History(inner) => Value::Stream(replay(inner, clock)),
            };
            (event.time.saturating_sub(start), value)
        })
        .collect();
    let complete_at = history.end_time.map(|end| end.saturating_sub(start));
    Observable::timed(clock, entries, complete_at)
}
