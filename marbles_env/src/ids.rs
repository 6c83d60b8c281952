//! Event id generation.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;

/// Identifier of one recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Single-writer source of strictly increasing event ids.
///
/// The generator is owned by the top-level driver and handed (by clone) to
/// every tracking session it starts. Clones share the same counter, so ids
/// stay unique and increasing across every group and every run that uses it.
#[derive(Debug, Clone, Default)]
pub struct EventIdGenerator {
    next: Rc<Cell<u64>>,
}

impl EventIdGenerator {
    /// Creates a generator starting at id 0.
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Creates a generator starting at the given id.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Rc::new(Cell::new(first)),
        }
    }
    
    /// Hands out the next id.
    pub fn next_id(&self) -> EventId {
        let id = self.next.get();
        self.next.set(id + 1);
        EventId(id)
    }
    
    /// Returns the id the next call to [`next_id`](Self::next_id) will return.
    pub fn peek(&self) -> EventId {
        EventId(self.next.get())
    }
}
