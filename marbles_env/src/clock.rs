//! The virtual clock driving one evaluation run.
//!
//! A discrete, single-threaded scheduler. Time only moves when [`VirtualClock::flush`]
//! pops the next queued action; nothing ever waits on a real timer. Actions due
//! at the same frame run in the order they were scheduled.

use crate::types::VirtualTime;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

/// Default horizon: large enough for any finite test case, small enough that an
/// `interval` with no `take` still terminates.
pub const DEFAULT_HORIZON: VirtualTime = 1_000_000_000;

/// An action waiting in the clock queue.
struct QueuedAction {
    /// Absolute frame the action is due at
    due: VirtualTime,

    /// Scheduling sequence number (tie-break for equal `due`)
    seq: u64,

    /// Shared with the [`ScheduledAction`] handle
    cancelled: Rc<Cell<bool>>,

    run: Box<dyn FnOnce()>,
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedAction {}

impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAction {
    // BinaryHeap is a max-heap; reversed so the earliest (due, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ClockState {
    now: Cell<VirtualTime>,
    next_seq: Cell<u64>,
    queue: RefCell<BinaryHeap<QueuedAction>>,
    horizon: VirtualTime,
    flushing: Cell<bool>,
}

/// Handle to a scheduled action; dropping it does not cancel the action.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    due: VirtualTime,
    cancelled: Rc<Cell<bool>>,
}

impl ScheduledAction {
    /// Prevents the action from running. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Absolute frame the action is due at.
    pub fn due(&self) -> VirtualTime {
        self.due
    }
}

/// Summary of one [`VirtualClock::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Actions that actually ran (cancelled ones excluded)
    pub executed: u64,

    /// True if actions beyond the horizon were discarded
    pub hit_horizon: bool,
}

/// Private logical time source for one evaluation run.
///
/// Cloning yields another handle to the same clock. A clock is never shared
/// across runs: every run allocates a fresh one.
#[derive(Clone)]
pub struct VirtualClock {
    state: Rc<ClockState>,
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .field("horizon", &self.state.horizon)
            .finish()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets the re-entrancy flag even if an action panics.
struct FlushGuard<'a>(&'a Cell<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl VirtualClock {
    /// Creates a clock at frame 0 with the [`DEFAULT_HORIZON`].
    pub fn new() -> Self {
        Self::with_horizon(DEFAULT_HORIZON)
    }

    /// Creates a clock at frame 0 that never runs actions due after `horizon`.
    pub fn with_horizon(horizon: VirtualTime) -> Self {
        Self {
            state: Rc::new(ClockState {
                now: Cell::new(0),
                next_seq: Cell::new(0),
                queue: RefCell::new(BinaryHeap::new()),
                horizon,
                flushing: Cell::new(false),
            }),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> VirtualTime {
        self.state.now.get()
    }

    /// Last frame at which actions may still run.
    pub fn horizon(&self) -> VirtualTime {
        self.state.horizon
    }

    /// Number of queued actions, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.state.queue.borrow().len()
    }

    /// True while [`flush`](Self::flush) is running.
    pub fn is_flushing(&self) -> bool {
        self.state.flushing.get()
    }

    /// Schedules `action` to run `delay` frames from now.
    pub fn schedule(&self, delay: VirtualTime, action: impl FnOnce() + 'static) -> ScheduledAction {
        self.schedule_at(self.now().saturating_add(delay), action)
    }

    /// Schedules `action` at an absolute frame. Frames in the past are clamped to now.
    pub fn schedule_at(&self, due: VirtualTime, action: impl FnOnce() + 'static) -> ScheduledAction {
        let due = due.max(self.now());
        let seq = self.state.next_seq.get();
        self.state.next_seq.set(seq + 1);

        let cancelled = Rc::new(Cell::new(false));
        self.state.queue.borrow_mut().push(QueuedAction {
            due,
            seq,
            cancelled: cancelled.clone(),
            run: Box::new(action),
        });

        ScheduledAction { due, cancelled }
    }

    /// Runs queued actions in (due, seq) order until the queue is empty or the
    /// next action lies beyond the horizon, in which case the rest is discarded.
    ///
    /// Actions may schedule further actions. A nested call is a no-op.
    pub fn flush(&self) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        if self.state.flushing.replace(true) {
            return outcome;
        }
        let _guard = FlushGuard(&self.state.flushing);

        loop {
            let next = {
                let mut queue = self.state.queue.borrow_mut();
                match queue.peek() {
                    Some(action) if action.due <= self.state.horizon => queue.pop(),
                    Some(_) => {
                        outcome.hit_horizon = true;
                        None
                    }
                    None => None,
                }
            };

            let Some(action) = next else {
                break;
            };
            if action.cancelled.get() {
                continue;
            }

            self.state.now.set(action.due);
            (action.run)();
            outcome.executed += 1;
        }

        if outcome.hit_horizon {
            // Dropped outside the borrow: captured state may hold clock handles
            let discarded = std::mem::take(&mut *self.state.queue.borrow_mut());
            drop(discarded);
        }

        outcome
    }
}
