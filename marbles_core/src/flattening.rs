//! Higher-order operators: streams of streams in and out.

use crate::stream::{observer, Observable, StreamError, Subscriber, Subscription, Value};
use marbles_env::{ScheduledAction, VirtualClock, VirtualTime};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

/// Hot multicast stream: pushes to every current subscriber.
///
/// Subscribers arriving after termination receive the terminal notification only.
#[derive(Clone, Default)]
pub struct Subject {
    state: Rc<SubjectState>,
}

#[derive(Default)]
struct SubjectState {
    subscribers: RefCell<Vec<Subscriber>>,
    terminal: RefCell<Option<Option<StreamError>>>,
}

impl Subject {
    /// Creates a subject with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// A stream view of this subject.
    pub fn as_observable(&self) -> Observable {
        let state = self.state.clone();
        Observable::new(move |sub| {
            let terminal = state.terminal.borrow().clone();
            match terminal {
                Some(Some(e)) => {
                    sub.error(e);
                    return;
                }
                Some(None) => {
                    sub.complete();
                    return;
                }
                None => {}
            }
            state.subscribers.borrow_mut().push(sub);
        })
    }

    /// Pushes an item to every open subscriber.
    pub fn next(&self, value: Value) {
        for sub in self.live_subscribers() {
            sub.next(value.clone());
        }
    }

    /// Terminates every subscriber with an error.
    pub fn error(&self, error: StreamError) {
        if self.terminate(Some(error.clone())) {
            for sub in self.drain() {
                sub.error(error.clone());
            }
        }
    }

    /// Completes every subscriber.
    pub fn complete(&self) {
        if self.terminate(None) {
            for sub in self.drain() {
                sub.complete();
            }
        }
    }

    fn terminate(&self, error: Option<StreamError>) -> bool {
        let mut terminal = self.state.terminal.borrow_mut();
        if terminal.is_some() {
            return false;
        }
        *terminal = Some(error);
        true
    }

    // Snapshot, so subscribers may (un)subscribe while being notified
    fn live_subscribers(&self) -> Vec<Subscriber> {
        let mut subs = self.state.subscribers.borrow_mut();
        subs.retain(|s| !s.is_closed());
        subs.clone()
    }

    fn drain(&self) -> Vec<Subscriber> {
        std::mem::take(&mut *self.state.subscribers.borrow_mut())
    }
}

impl Observable {
    /// Maps each item to a stream and merges all of them.
    pub fn merge_map(&self, project: impl Fn(Value) -> Observable + 'static) -> Observable {
        let source = self.clone();
        let project = Rc::new(project);
        Observable::new(move |down| {
            let active = Rc::new(Cell::new(0usize));
            let outer_done = Rc::new(Cell::new(false));
            let project = project.clone();

            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            let (act, done) = (active.clone(), outer_done.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        act.set(act.get() + 1);
                        let inner = project(v);
                        let (i1, i2, i3) = (d1.clone(), d1.clone(), d1.clone());
                        let (act, done) = (act.clone(), done.clone());
                        inner.subscribe_inner(
                            &d1,
                            observer(
                                move |iv| i1.next(iv),
                                move |e| i2.error(e),
                                move || {
                                    act.set(act.get() - 1);
                                    if done.get() && act.get() == 0 {
                                        i3.complete();
                                    }
                                },
                            ),
                        );
                    },
                    move |e| d2.error(e),
                    move || {
                        outer_done.set(true);
                        if active.get() == 0 {
                            d3.complete();
                        }
                    },
                ),
            );
        })
    }

    /// Maps each item to a stream, dropping the previous inner stream.
    pub fn switch_map(&self, project: impl Fn(Value) -> Observable + 'static) -> Observable {
        let source = self.clone();
        let project = Rc::new(project);
        Observable::new(move |down| {
            let current: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
            let outer_done = Rc::new(Cell::new(false));
            let project = project.clone();

            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            let (cur, done) = (current.clone(), outer_done.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        if let Some(previous) = cur.borrow_mut().take() {
                            previous.unsubscribe();
                        }
                        let inner = project(v);
                        let (i1, i2, i3) = (d1.clone(), d1.clone(), d1.clone());
                        let (slot, done) = (cur.clone(), done.clone());
                        let inner_sub = Subscription::new();
                        let me = inner_sub.clone();
                        let subscriber = Subscriber::with_subscription(
                            observer(
                                move |iv| i1.next(iv),
                                move |e| i2.error(e),
                                move || {
                                    let finished_current = slot
                                        .borrow()
                                        .as_ref()
                                        .is_some_and(|s| s.ptr_eq(&me));
                                    if finished_current {
                                        slot.borrow_mut().take();
                                    }
                                    if done.get() && slot.borrow().is_none() {
                                        i3.complete();
                                    }
                                },
                            ),
                            inner_sub.clone(),
                        );
                        d1.subscription().add_child(&inner_sub);
                        *cur.borrow_mut() = Some(inner_sub);
                        inner.subscribe_with(subscriber);
                    },
                    move |e| d2.error(e),
                    move || {
                        outer_done.set(true);
                        if current.borrow().is_none() {
                            d3.complete();
                        }
                    },
                ),
            );
        })
    }

    /// Maps each item to a stream, running them one at a time in order.
    pub fn concat_map(&self, project: impl Fn(Value) -> Observable + 'static) -> Observable {
        let source = self.clone();
        let project: Rc<dyn Fn(Value) -> Observable> = Rc::new(project);
        Observable::new(move |down| {
            let state = Rc::new(ConcatState {
                queue: RefCell::new(VecDeque::new()),
                busy: Cell::new(false),
                outer_done: Cell::new(false),
                project: project.clone(),
                down: down.clone(),
            });

            let (s1, s2) = (state.clone(), state.clone());
            let d2 = down.clone();
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        s1.queue.borrow_mut().push_back(v);
                        if !s1.busy.get() {
                            ConcatState::run_next(&s1);
                        }
                    },
                    move |e| d2.error(e),
                    move || {
                        s2.outer_done.set(true);
                        if !s2.busy.get() && s2.queue.borrow().is_empty() {
                            s2.down.complete();
                        }
                    },
                ),
            );
        })
    }

    /// Flattens a stream of streams concurrently. Data items are an error.
    pub fn merge_all(&self) -> Observable {
        self.merge_map(|v| match v {
            Value::Stream(inner) => inner,
            Value::Data(d) => Observable::throw_error(format!("merge_all expected a stream, got {d}")),
        })
    }

    /// Splits items into one inner stream per key. Each inner stream is emitted
    /// when its key is first seen.
    pub fn group_by(&self, key: impl Fn(&Value) -> String + 'static) -> Observable {
        let source = self.clone();
        let key = Rc::new(key);
        Observable::new(move |down| {
            let groups: Rc<RefCell<BTreeMap<String, Subject>>> = Rc::new(RefCell::new(BTreeMap::new()));
            let key = key.clone();

            let (g1, g2, g3) = (groups.clone(), groups.clone(), groups.clone());
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        let k = key(&v);
                        let existing = g1.borrow().get(&k).cloned();
                        let subject = match existing {
                            Some(subject) => subject,
                            None => {
                                let subject = Subject::new();
                                g1.borrow_mut().insert(k, subject.clone());
                                d1.next(Value::Stream(subject.as_observable()));
                                subject
                            }
                        };
                        subject.next(v);
                    },
                    move |e| {
                        let subjects: Vec<Subject> = g2.borrow().values().cloned().collect();
                        subjects.iter().for_each(|s| s.error(e.clone()));
                        d2.error(e);
                    },
                    move || {
                        let subjects: Vec<Subject> = g3.borrow().values().cloned().collect();
                        subjects.iter().for_each(Subject::complete);
                        d3.complete();
                    },
                ),
            );
        })
    }

    /// Emits a new window stream every `size` items; the first window opens on subscription.
    pub fn window_count(&self, size: usize) -> Observable {
        let source = self.clone();
        let size = size.max(1);
        Observable::new(move |down| {
            let window = Rc::new(RefCell::new(Subject::new()));
            down.next(Value::Stream(window.borrow().as_observable()));
            let count = Rc::new(Cell::new(0usize));

            let (w1, w2, w3) = (window.clone(), window.clone(), window);
            let (d1, d2, d3) = (down.clone(), down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        let current = w1.borrow().clone();
                        current.next(v);
                        count.set(count.get() + 1);
                        if count.get() == size {
                            count.set(0);
                            current.complete();
                            let fresh = Subject::new();
                            *w1.borrow_mut() = fresh.clone();
                            d1.next(Value::Stream(fresh.as_observable()));
                        }
                    },
                    move |e| {
                        let current = w2.borrow().clone();
                        current.error(e.clone());
                        d2.error(e);
                    },
                    move || {
                        let current = w3.borrow().clone();
                        current.complete();
                        d3.complete();
                    },
                ),
            );
        })
    }

    /// Emits a new window stream every `span` frames; the first window opens on subscription.
    pub fn window_time(&self, clock: &VirtualClock, span: VirtualTime) -> Observable {
        let source = self.clone();
        let clock = clock.clone();
        let span = span.max(1);
        Observable::new(move |down| {
            let window = Rc::new(RefCell::new(Subject::new()));
            down.next(Value::Stream(window.borrow().as_observable()));

            let pending: Rc<RefCell<Option<ScheduledAction>>> = Rc::new(RefCell::new(None));
            rotate_window(&clock, span, window.clone(), down.clone(), pending.clone());
            down.add_teardown(move || {
                if let Some(handle) = pending.borrow_mut().take() {
                    handle.cancel();
                }
            });

            let (w1, w2, w3) = (window.clone(), window.clone(), window);
            let (d2, d3) = (down.clone(), down.clone());
            source.subscribe_inner(
                &down,
                observer(
                    move |v| {
                        let current = w1.borrow().clone();
                        current.next(v);
                    },
                    move |e| {
                        let current = w2.borrow().clone();
                        current.error(e.clone());
                        d2.error(e);
                    },
                    move || {
                        let current = w3.borrow().clone();
                        current.complete();
                        d3.complete();
                    },
                ),
            );
        })
    }
}

struct ConcatState {
    queue: RefCell<VecDeque<Value>>,
    busy: Cell<bool>,
    outer_done: Cell<bool>,
    project: Rc<dyn Fn(Value) -> Observable>,
    down: Subscriber,
}

impl ConcatState {
    fn run_next(state: &Rc<ConcatState>) {
        let next = state.queue.borrow_mut().pop_front();
        let Some(value) = next else {
            state.busy.set(false);
            if state.outer_done.get() {
                state.down.complete();
            }
            return;
        };
        state.busy.set(true);
        let inner = (state.project)(value);
        let (i1, i2) = (state.down.clone(), state.down.clone());
        let next_state = state.clone();
        inner.subscribe_inner(
            &state.down,
            observer(
                move |v| i1.next(v),
                move |e| i2.error(e),
                move || ConcatState::run_next(&next_state),
            ),
        );
    }
}

fn rotate_window(
    clock: &VirtualClock,
    span: VirtualTime,
    window: Rc<RefCell<Subject>>,
    down: Subscriber,
    pending: Rc<RefCell<Option<ScheduledAction>>>,
) {
    if down.is_closed() {
        return;
    }
    let next_clock = clock.clone();
    let slot = pending.clone();
    let handle = clock.schedule(span, move || {
        let closing = window.borrow().clone();
        closing.complete();
        let fresh = Subject::new();
        *window.borrow_mut() = fresh.clone();
        down.next(Value::Stream(fresh.as_observable()));
        rotate_window(&next_clock, span, window, down, slot);
    });
    *pending.borrow_mut() = Some(handle);
}
