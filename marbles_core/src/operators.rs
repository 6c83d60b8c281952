//! Element-wise transformation operators.

use crate::stream::{observer, Observable, StreamError, Value};
use marbles_env::{ScheduledAction, VirtualClock, VirtualTime};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

impl Observable {
    /// Applies `f` to every item.
    pub fn map(&self, f: impl Fn(Value) -> Value + 'static) -> Observable {
        self.try_map(move |v| Ok(f(v)))
    }

    /// Applies a fallible `f`; an `Err` becomes an error notification.
    pub fn try_map(&self, f: impl Fn(Value) -> Result<Value, StreamError> + 'static) -> Observable {
        let source = self.clone();
        let f = Rc::new(f);
        Observable::new(move |down| {
            let f = f.clone();
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| match f(v) {
                        Ok(mapped) => d1.next(mapped),
                        Err(e) => d1.error(e),
                    },
                    move |e| d2.error(e),
                    move || d3.complete(),
                ),
            );
        })
    }

    /// Keeps items for which `predicate` holds.
    pub fn filter(&self, predicate: impl Fn(&Value) -> bool + 'static) -> Observable {
        let source = self.clone();
        let predicate = Rc::new(predicate);
        Observable::new(move |down| {
            let predicate = predicate.clone();
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        if predicate(&v) {
                            d1.next(v);
                        }
                    },
                    move |e| d2.error(e),
                    move || d3.complete(),
                ),
            );
        })
    }

    /// Forwards the first `count` items, then completes and unsubscribes upstream.
    pub fn take(&self, count: usize) -> Observable {
        let source = self.clone();
        Observable::new(move |down| {
            if count == 0 {
                down.complete();
                return;
            }
            let seen = Rc::new(Cell::new(0usize));
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        seen.set(seen.get() + 1);
                        d1.next(v);
                        if seen.get() >= count {
                            d1.complete();
                        }
                    },
                    move |e| d2.error(e),
                    move || d3.complete(),
                ),
            );
        })
    }

    /// Drops the first `count` items.
    pub fn skip(&self, count: usize) -> Observable {
        let source = self.clone();
        Observable::new(move |down| {
            let seen = Rc::new(Cell::new(0usize));
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        if seen.get() < count {
                            seen.set(seen.get() + 1);
                        } else {
                            d1.next(v);
                        }
                    },
                    move |e| d2.error(e),
                    move || d3.complete(),
                ),
            );
        })
    }

    /// Emits every intermediate accumulator.
    pub fn scan(&self, seed: impl Into<Value>, f: impl Fn(&Value, Value) -> Value + 'static) -> Observable {
        let source = self.clone();
        let seed = seed.into();
        let f = Rc::new(f);
        Observable::new(move |down| {
            let acc = Rc::new(RefCell::new(seed.clone()));
            let f = f.clone();
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        let next = f(&acc.borrow(), v);
                        *acc.borrow_mut() = next.clone();
                        d1.next(next);
                    },
                    move |e| d2.error(e),
                    move || d3.complete(),
                ),
            );
        })
    }

    /// Emits the final accumulator on completion.
    pub fn reduce(&self, seed: impl Into<Value>, f: impl Fn(&Value, Value) -> Value + 'static) -> Observable {
        let source = self.clone();
        let seed = seed.into();
        let f = Rc::new(f);
        Observable::new(move |down| {
            let acc = Rc::new(RefCell::new(seed.clone()));
            let result = acc.clone();
            let f = f.clone();
            let (d2, d3) = (down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        let next = f(&acc.borrow(), v);
                        *acc.borrow_mut() = next;
                    },
                    move |e| d2.error(e),
                    move || {
                        d3.next(result.borrow().clone());
                        d3.complete();
                    },
                ),
            );
        })
    }

    /// Emits `values` before anything from this stream.
    pub fn start_with<I, V>(&self, values: I) -> Observable
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Observable::concat(vec![Observable::of(values), self.clone()])
    }

    /// Runs this stream and `other` concurrently.
    pub fn merge_with(&self, other: &Observable) -> Observable {
        Observable::merge(vec![self.clone(), other.clone()])
    }

    /// Shifts every item `by` frames later. Completion waits for the last
    /// delayed item; errors are forwarded immediately.
    pub fn delay(&self, clock: &VirtualClock, by: VirtualTime) -> Observable {
        let source = self.clone();
        let clock = clock.clone();
        Observable::new(move |down| {
            let in_flight = Rc::new(Cell::new(0usize));
            let source_done = Rc::new(Cell::new(false));
            let handles: Rc<RefCell<Vec<ScheduledAction>>> = Rc::new(RefCell::new(Vec::new()));

            let cleanup = handles.clone();
            down.add_teardown(move || cleanup.borrow().iter().for_each(ScheduledAction::cancel));

            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            let (flight, done) = (in_flight.clone(), source_done.clone());
            let clock = clock.clone();
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        flight.set(flight.get() + 1);
                        let target = d1.clone();
                        let flight = flight.clone();
                        let done = done.clone();
                        let handle = clock.schedule(by, move || {
                            target.next(v);
                            flight.set(flight.get() - 1);
                            if done.get() && flight.get() == 0 {
                                target.complete();
                            }
                        });
                        handles.borrow_mut().push(handle);
                    },
                    move |e| d2.error(e),
                    move || {
                        source_done.set(true);
                        if in_flight.get() == 0 {
                            d3.complete();
                        }
                    },
                ),
            );
        })
    }

    /// Runs `effect` for every item, passing items through unchanged.
    pub fn tap(&self, effect: impl Fn(&Value) + 'static) -> Observable {
        let effect = Rc::new(effect);
        self.map(move |v| {
            effect(&v);
            v
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Notification, Recorder};
    use serde_json::json;

    fn add(acc: &Value, v: Value) -> Value {
        Value::from(acc.as_i64().unwrap_or(0) + v.as_i64().unwrap_or(0))
    }

    #[test]
    fn test_map_and_filter() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        Observable::range(1, 6)
            .filter(|v| v.as_i64().is_some_and(|n| n % 2 == 0))
            .map(|v| Value::from(v.as_i64().unwrap_or(0) * 10))
            .subscribe(rec.clone());

        assert_eq!(rec.values(), vec![(0, json!(20)), (0, json!(40)), (0, json!(60))]);
        assert!(rec.completed());
    }

    #[test]
    fn test_try_map_errors() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        Observable::of([1, 2, 3])
            .try_map(|v| {
                if v.as_i64() == Some(2) {
                    Err(StreamError::new("two"))
                } else {
                    Ok(v)
                }
            })
            .subscribe(rec.clone());

        assert_eq!(
            rec.notifications(),
            vec![
                (0, Notification::Next(Value::from(1))),
                (0, Notification::Error(StreamError::new("two"))),
            ]
        );
    }

    #[test]
    fn test_take_stops_infinite_source() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        Observable::interval(&clock, 10).take(3).subscribe(rec.clone());
        clock.flush();

        assert_eq!(rec.values(), vec![(10, json!(0)), (20, json!(1)), (30, json!(2))]);
        assert_eq!(rec.terminated_at(), Some(30));
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_take_zero_completes_without_subscribing() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        Observable::throw_error("never subscribed").take(0).subscribe(rec.clone());
        assert_eq!(rec.notifications(), vec![(0, Notification::Complete)]);
    }

    #[test]
    fn test_scan_and_reduce() {
        let clock = VirtualClock::new();
        let scanned = Recorder::new(&clock);
        let reduced = Recorder::new(&clock);
        let source = Observable::of([1, 2, 3, 4]);
        source.scan(0, add).subscribe(scanned.clone());
        source.reduce(0, add).subscribe(reduced.clone());

        let scanned: Vec<_> = scanned.values().into_iter().map(|(_, v)| v).collect();
        assert_eq!(scanned, vec![json!(1), json!(3), json!(6), json!(10)]);
        assert_eq!(reduced.values(), vec![(0, json!(10))]);
    }

    #[test]
    fn test_skip_and_start_with() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        Observable::of([1, 2, 3]).skip(2).start_with([0]).subscribe(rec.clone());
        assert_eq!(rec.values(), vec![(0, json!(0)), (0, json!(3))]);
    }

    #[test]
    fn test_delay_shifts_items_and_completion() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);
        Observable::of([1, 2]).delay(&clock, 10).subscribe(rec.clone());
        clock.flush();

        assert_eq!(rec.values(), vec![(10, json!(1)), (10, json!(2))]);
        assert_eq!(rec.terminated_at(), Some(10));
    }
}
