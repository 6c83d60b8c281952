//! Rate-limiting operators on the virtual clock.

use crate::stream::{observer, Observable, Value};
use marbles_env::{ScheduledAction, VirtualClock, VirtualTime};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Pending emission shared between the item handler, the timer and completion.
#[derive(Default)]
struct Pending {
    value: RefCell<Option<Value>>,
    timer: RefCell<Option<ScheduledAction>>,
    source_done: Cell<bool>,
}

impl Pending {
    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.borrow_mut().take() {
            handle.cancel();
        }
    }
}

impl Observable {
    /// Emits an item only after `quiet` frames without a newer one.
    /// On completion a pending item is flushed immediately.
    pub fn debounce_time(&self, clock: &VirtualClock, quiet: VirtualTime) -> Observable {
        let source = self.clone();
        let clock = clock.clone();
        Observable::new(move |down| {
            let pending = Rc::new(Pending::default());
            let cleanup = pending.clone();
            down.add_teardown(move || cleanup.cancel_timer());

            let (p1, p3) = (pending.clone(), pending);
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            let clock = clock.clone();
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        p1.cancel_timer();
                        *p1.value.borrow_mut() = Some(v);
                        let (target, state) = (d1.clone(), p1.clone());
                        let handle = clock.schedule(quiet, move || {
                            state.timer.borrow_mut().take();
                            let value = state.value.borrow_mut().take();
                            if let Some(value) = value {
                                target.next(value);
                            }
                        });
                        *p1.timer.borrow_mut() = Some(handle);
                    },
                    move |e| d2.error(e),
                    move || {
                        p3.cancel_timer();
                        let value = p3.value.borrow_mut().take();
                        if let Some(value) = value {
                            d3.next(value);
                        }
                        d3.complete();
                    },
                ),
            );
        })
    }

    /// Emits the first item, then ignores items for `window` frames.
    pub fn throttle_time(&self, clock: &VirtualClock, window: VirtualTime) -> Observable {
        let source = self.clone();
        let clock = clock.clone();
        Observable::new(move |down| {
            let pending = Rc::new(Pending::default());
            let cleanup = pending.clone();
            down.add_teardown(move || cleanup.cancel_timer());

            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            let clock = clock.clone();
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        if pending.timer.borrow().is_some() {
                            return;
                        }
                        d1.next(v);
                        let state = pending.clone();
                        let handle = clock.schedule(window, move || {
                            state.timer.borrow_mut().take();
                        });
                        *pending.timer.borrow_mut() = Some(handle);
                    },
                    move |e| d2.error(e),
                    move || d3.complete(),
                ),
            );
        })
    }

    /// Once an item arrives, waits `window` frames and emits the latest item seen.
    /// Completion waits for a pending emission.
    pub fn audit_time(&self, clock: &VirtualClock, window: VirtualTime) -> Observable {
        let source = self.clone();
        let clock = clock.clone();
        Observable::new(move |down| {
            let pending = Rc::new(Pending::default());
            let cleanup = pending.clone();
            down.add_teardown(move || cleanup.cancel_timer());

            let (p1, p3) = (pending.clone(), pending);
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            let clock = clock.clone();
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        *p1.value.borrow_mut() = Some(v);
                        if p1.timer.borrow().is_some() {
                            return;
                        }
                        let (target, state) = (d1.clone(), p1.clone());
                        let handle = clock.schedule(window, move || {
                            state.timer.borrow_mut().take();
                            let value = state.value.borrow_mut().take();
                            if let Some(value) = value {
                                target.next(value);
                            }
                            if state.source_done.get() {
                                target.complete();
                            }
                        });
                        *p1.timer.borrow_mut() = Some(handle);
                    },
                    move |e| d2.error(e),
                    move || {
                        p3.source_done.set(true);
                        if p3.timer.borrow().is_none() {
                            d3.complete();
                        }
                    },
                ),
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Recorder;
    use serde_json::json;

    fn burst(clock: &VirtualClock) -> Observable {
        // a@0 b@2 c@4 ... d@20, complete@30
        Observable::timed(
            clock,
            vec![
                (0, Value::from("a")),
                (2, Value::from("b")),
                (4, Value::from("c")),
                (20, Value::from("d")),
            ],
            Some(30),
        )
    }

    #[test]
    fn test_debounce_emits_after_quiet_period() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        burst(&clock).debounce_time(&clock, 5).subscribe(rec.clone());
        clock.flush();

        assert_eq!(rec.values(), vec![(9, json!("c")), (25, json!("d"))]);
        assert_eq!(rec.terminated_at(), Some(30));
    }

    #[test]
    fn test_debounce_flushes_on_complete() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        Observable::of([1, 2]).debounce_time(&clock, 5).subscribe(rec.clone());
        clock.flush();

        assert_eq!(rec.values(), vec![(0, json!(2))]);
        assert!(rec.completed());
    }

    #[test]
    fn test_throttle_keeps_leading_items() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        burst(&clock).throttle_time(&clock, 5).subscribe(rec.clone());
        clock.flush();

        assert_eq!(rec.values(), vec![(0, json!("a")), (20, json!("d"))]);
    }

    #[test]
    fn test_audit_emits_latest_after_window() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        burst(&clock).audit_time(&clock, 5).subscribe(rec.clone());
        clock.flush();

        assert_eq!(rec.values(), vec![(5, json!("c")), (25, json!("d"))]);
        assert_eq!(rec.terminated_at(), Some(30));
    }
}
