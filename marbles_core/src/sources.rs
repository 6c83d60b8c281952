//! Creation operators.

use crate::stream::{observer, Observable, StreamError, Subscriber, Value};
use marbles_env::{ScheduledAction, VirtualClock, VirtualTime};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

impl Observable {
    /// Emits the given values synchronously on subscription, then completes.
    pub fn of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Rc<[Value]> = values.into_iter().map(Into::into).collect();
        Observable::new(move |sub| {
            for value in values.iter() {
                if sub.is_closed() {
                    return;
                }
                sub.next(value.clone());
            }
            sub.complete();
        })
    }

    /// Emits `start, start + 1, ..` (`count` numbers) synchronously, then completes.
    /// Errors instead of emitting a number past `i64::MAX`.
    pub fn range(start: i64, count: u64) -> Self {
        Observable::new(move |sub| {
            for i in 0..count {
                if sub.is_closed() {
                    return;
                }
                match i64::try_from(i).ok().and_then(|offset| start.checked_add(offset)) {
                    Some(n) => sub.next(Value::from(n)),
                    None => {
                        sub.error(StreamError::new(format!("range overflows i64 after {start} + {i}")));
                        return;
                    }
                }
            }
            sub.complete();
        })
    }

    /// Completes immediately.
    pub fn empty() -> Self {
        Observable::new(|sub| sub.complete())
    }

    /// Never emits, never terminates.
    pub fn never() -> Self {
        Observable::new(|_| {})
    }

    /// Errors immediately.
    pub fn throw_error(message: impl Into<String>) -> Self {
        let error = StreamError::new(message);
        Observable::new(move |sub| sub.error(error.clone()))
    }

    /// Emits `0` after `due` frames, then completes.
    pub fn timer(clock: &VirtualClock, due: VirtualTime) -> Self {
        let clock = clock.clone();
        Observable::new(move |sub| {
            let target = sub.clone();
            let handle = clock.schedule(due, move || {
                target.next(Value::from(0));
                target.complete();
            });
            sub.add_teardown(move || handle.cancel());
        })
    }

    /// Emits `0, 1, 2, ..` every `period` frames, forever.
    ///
    /// A zero period is treated as one frame, otherwise the clock could never advance.
    pub fn interval(clock: &VirtualClock, period: VirtualTime) -> Self {
        let clock = clock.clone();
        let period = period.max(1);
        Observable::new(move |sub| {
            let pending: Rc<RefCell<Option<ScheduledAction>>> = Rc::new(RefCell::new(None));
            schedule_tick(&clock, sub.clone(), period, 0, pending.clone());
            sub.add_teardown(move || {
                if let Some(handle) = pending.borrow_mut().take() {
                    handle.cancel();
                }
            });
        })
    }

    /// Emits each value at its offset (frames after subscription), then completes at
    /// `complete_at` if given; otherwise stays open.
    ///
    /// Entries must be ordered by offset.
    pub fn timed<I>(clock: &VirtualClock, entries: I, complete_at: Option<VirtualTime>) -> Self
    where
        I: IntoIterator<Item = (VirtualTime, Value)>,
    {
        let clock = clock.clone();
        let entries: Rc<[(VirtualTime, Value)]> = entries.into_iter().collect();
        Observable::new(move |sub| {
            let mut handles = Vec::with_capacity(entries.len() + 1);
            for (offset, value) in entries.iter() {
                let target = sub.clone();
                let value = value.clone();
                handles.push(clock.schedule(*offset, move || target.next(value)));
            }
            if let Some(end) = complete_at {
                let target = sub.clone();
                handles.push(clock.schedule(end, move || target.complete()));
            }
            sub.add_teardown(move || handles.iter().for_each(ScheduledAction::cancel));
        })
    }

    /// Subscribes to all sources at once and forwards everything; completes
    /// when every source has completed.
    pub fn merge(sources: Vec<Observable>) -> Self {
        let sources: Rc<[Observable]> = sources.into();
        Observable::new(move |down| {
            if sources.is_empty() {
                down.complete();
                return;
            }
            let remaining = Rc::new(Cell::new(sources.len()));
            for source in sources.iter() {
                if down.is_closed() {
                    return;
                }
                let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
                let remaining = remaining.clone();
                source.subscribe_inner(
                    &down,
                    observer(
                        move |v| d1.next(v),
                        move |e| d2.error(e),
                        move || {
                            remaining.set(remaining.get() - 1);
                            if remaining.get() == 0 {
                                d3.complete();
                            }
                        },
                    ),
                );
            }
        })
    }

    /// Subscribes to the sources one after another.
    pub fn concat(sources: Vec<Observable>) -> Self {
        let sources: Rc<[Observable]> = sources.into();
        Observable::new(move |down| subscribe_nth(sources.clone(), 0, down))
    }
}

fn schedule_tick(
    clock: &VirtualClock,
    sub: Subscriber,
    period: VirtualTime,
    n: u64,
    pending: Rc<RefCell<Option<ScheduledAction>>>,
) {
    if sub.is_closed() {
        return;
    }
    let next_clock = clock.clone();
    let slot = pending.clone();
    let handle = clock.schedule(period, move || {
        sub.next(Value::from(n));
        schedule_tick(&next_clock, sub, period, n + 1, slot);
    });
    *pending.borrow_mut() = Some(handle);
}

fn subscribe_nth(sources: Rc<[Observable]>, index: usize, down: Subscriber) {
    let Some(source) = sources.get(index).cloned() else {
        down.complete();
        return;
    };
    if down.is_closed() {
        return;
    }
    let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
    source.subscribe_inner(
        &down,
        observer(
            move |v| d1.next(v),
            move |e| d2.error(e),
            move || subscribe_nth(sources.clone(), index + 1, d3.clone()),
        ),
    );
}
