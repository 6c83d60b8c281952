//! The push-based stream model user definitions are written against.
//!
//! Single-threaded and cold: every [`Observable::subscribe`] runs the producer
//! again. "Concurrency" between streams only exists as interleaving of actions
//! on the run's [`VirtualClock`](marbles_env::VirtualClock).
//!
//! Notification grammar enforced by [`Subscriber`]: `next* (error | complete)?`.
//! After a terminal notification or after unsubscription nothing is delivered.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Error notification carried through a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StreamError(pub String);

impl StreamError {
    /// Creates a stream error from a message.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One item flowing through a stream: plain data or a nested stream.
#[derive(Debug, Clone)]
pub enum Value {
    /// Structured data
    Data(serde_json::Value),

    /// A stream of streams emits streams
    Stream(Observable),
}

impl Value {
    /// Wraps anything JSON-convertible.
    pub fn data(value: impl Into<serde_json::Value>) -> Self {
        Self::Data(value.into())
    }

    /// Returns the data, if this is not a stream.
    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(v) => Some(v),
            Self::Stream(_) => None,
        }
    }

    /// Returns the nested stream, if any.
    pub fn as_stream(&self) -> Option<&Observable> {
        match self {
            Self::Stream(o) => Some(o),
            Self::Data(_) => None,
        }
    }

    /// Numeric view of the data (integers and integral floats).
    pub fn as_i64(&self) -> Option<i64> {
        let data = self.as_data()?;
        data.as_i64()
            .or_else(|| data.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
    }

    /// Floating point view of the data.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_data()?.as_f64()
    }

    /// Returns true for nested streams.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Data(a), Self::Data(b)) => a == b,
            (Self::Stream(a), Self::Stream(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Data(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::data(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::data(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::data(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::data(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::data(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::data(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::data(v)
    }
}

impl From<Observable> for Value {
    fn from(v: Observable) -> Self {
        Self::Stream(v)
    }
}

/// Receiver of stream notifications.
pub trait Observer {
    /// Called for every emitted item.
    fn next(&self, value: Value);

    /// Terminal: the stream failed.
    fn error(&self, error: StreamError);

    /// Terminal: the stream finished normally.
    fn complete(&self);
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn next(&self, _value: Value) {}
    fn error(&self, _error: StreamError) {}
    fn complete(&self) {}
}

/// Observer assembled from three closures.
pub struct FnObserver<N, E, C> {
    on_next: N,
    on_error: E,
    on_complete: C,
}

/// Builds an [`Observer`] from closures.
pub fn observer<N, E, C>(on_next: N, on_error: E, on_complete: C) -> FnObserver<N, E, C>
where
    N: Fn(Value),
    E: Fn(StreamError),
    C: Fn(),
{
    FnObserver {
        on_next,
        on_error,
        on_complete,
    }
}

impl<N, E, C> Observer for FnObserver<N, E, C>
where
    N: Fn(Value),
    E: Fn(StreamError),
    C: Fn(),
{
    fn next(&self, value: Value) {
        (self.on_next)(value)
    }

    fn error(&self, error: StreamError) {
        (self.on_error)(error)
    }

    fn complete(&self) {
        (self.on_complete)()
    }
}

enum Finalizer {
    Teardown(Box<dyn FnOnce()>),
    Child(Subscription),
}

#[derive(Default)]
struct SubscriptionState {
    closed: Cell<bool>,
    finalizers: RefCell<Vec<Finalizer>>,
}

/// Cancellation handle; clones refer to the same subscription.
#[derive(Clone, Default)]
pub struct Subscription {
    state: Rc<SubscriptionState>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Subscription {
    /// Creates an open subscription with no teardowns.
    pub fn new() -> Self {
        Self::default()
    }

    /// True after [`unsubscribe`](Self::unsubscribe).
    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Registers a teardown. Runs it immediately if already closed.
    pub fn add(&self, teardown: impl FnOnce() + 'static) {
        if self.is_closed() {
            teardown();
        } else {
            self.state.finalizers.borrow_mut().push(Finalizer::Teardown(Box::new(teardown)));
        }
    }

    /// Unsubscribing `self` will unsubscribe `child` as well.
    ///
    /// A child that closes on its own is dropped from `self` right away, so a
    /// long-lived parent only holds the children still running.
    pub fn add_child(&self, child: &Subscription) {
        if self.is_closed() {
            child.unsubscribe();
            return;
        }
        if child.is_closed() {
            return;
        }
        self.state.finalizers.borrow_mut().push(Finalizer::Child(child.clone()));

        let parent = Rc::downgrade(&self.state);
        let key = Rc::as_ptr(&child.state);
        child.add(move || {
            let Some(parent) = parent.upgrade() else {
                return;
            };
            // Removed entry is dropped after the borrow ends
            let removed = {
                let mut finalizers = parent.finalizers.borrow_mut();
                finalizers
                    .iter()
                    .position(|f| matches!(f, Finalizer::Child(c) if Rc::as_ptr(&c.state) == key))
                    .map(|i| finalizers.remove(i))
            };
            drop(removed);
        });
    }

    /// Closes the subscription and runs teardowns in registration order. Idempotent.
    pub fn unsubscribe(&self) {
        if self.state.closed.replace(true) {
            return;
        }
        let finalizers = std::mem::take(&mut *self.state.finalizers.borrow_mut());
        for finalizer in finalizers {
            match finalizer {
                Finalizer::Teardown(teardown) => teardown(),
                Finalizer::Child(child) => child.unsubscribe(),
            }
        }
    }

    /// Teardowns and children still registered.
    pub fn pending(&self) -> usize {
        self.state.finalizers.borrow().len()
    }

    /// True if both handles refer to the same subscription.
    pub fn ptr_eq(&self, other: &Subscription) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

/// An observer bound to a subscription; what a producer pushes into.
#[derive(Clone)]
pub struct Subscriber {
    observer: Rc<dyn Observer>,
    subscription: Subscription,
    stopped: Rc<Cell<bool>>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Subscriber {
    /// Wraps an observer with a fresh subscription.
    pub fn new(observer: impl Observer + 'static) -> Self {
        Self::with_subscription(observer, Subscription::new())
    }

    /// Wraps an observer with a subscription created beforehand, so the
    /// observer itself can hold a handle to it.
    pub fn with_subscription(observer: impl Observer + 'static, subscription: Subscription) -> Self {
        Self {
            observer: Rc::new(observer),
            subscription,
            stopped: Rc::new(Cell::new(false)),
        }
    }

    /// The subscription producers attach their teardowns to.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Shorthand for `subscription().add(teardown)`.
    pub fn add_teardown(&self, teardown: impl FnOnce() + 'static) {
        self.subscription.add(teardown);
    }

    /// True once terminated or unsubscribed; producers should stop emitting.
    pub fn is_closed(&self) -> bool {
        self.stopped.get() || self.subscription.is_closed()
    }

    /// Delivers an item unless closed.
    pub fn next(&self, value: Value) {
        if !self.is_closed() {
            self.observer.next(value);
        }
    }

    /// Delivers an error unless closed, then releases resources.
    pub fn error(&self, error: StreamError) {
        if self.is_closed() {
            return;
        }
        self.stopped.set(true);
        self.observer.error(error);
        self.subscription.unsubscribe();
    }

    /// Delivers completion unless closed, then releases resources.
    pub fn complete(&self) {
        if self.is_closed() {
            return;
        }
        self.stopped.set(true);
        self.observer.complete();
        self.subscription.unsubscribe();
    }
}

impl Observer for Subscriber {
    fn next(&self, value: Value) {
        Subscriber::next(self, value)
    }

    fn error(&self, error: StreamError) {
        Subscriber::error(self, error)
    }

    fn complete(&self) {
        Subscriber::complete(self)
    }
}

/// A cold stream.
#[derive(Clone)]
pub struct Observable {
    producer: Rc<dyn Fn(Subscriber)>,
}

impl fmt::Debug for Observable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observable")
    }
}

impl Observable {
    /// Creates a stream from a producer run once per subscription.
    pub fn new(producer: impl Fn(Subscriber) + 'static) -> Self {
        Self {
            producer: Rc::new(producer),
        }
    }

    /// Subscribes an observer and returns the subscription handle.
    pub fn subscribe(&self, observer: impl Observer + 'static) -> Subscription {
        let subscriber = Subscriber::new(observer);
        let subscription = subscriber.subscription().clone();
        self.subscribe_with(subscriber);
        subscription
    }

    /// Runs the producer against an existing subscriber.
    pub fn subscribe_with(&self, subscriber: Subscriber) {
        (self.producer)(subscriber)
    }

    /// Operator plumbing: subscribes upstream with an observer built around
    /// `downstream`, and chains the upstream subscription to the downstream one.
    pub(crate) fn subscribe_inner(&self, downstream: &Subscriber, observer: impl Observer + 'static) -> Subscription {
        let upstream = Subscriber::new(observer);
        let subscription = upstream.subscription().clone();
        downstream.subscription().add_child(&subscription);
        self.subscribe_with(upstream);
        subscription
    }

    /// True if both handles share the same producer.
    pub fn ptr_eq(&self, other: &Observable) -> bool {
        Rc::ptr_eq(&self.producer, &other.producer)
    }
}

/// One recorded notification (used by [`Recorder`]).
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// `next(value)`
    Next(Value),
    /// `error(err)`
    Error(StreamError),
    /// `complete()`
    Complete,
}

/// Observer that keeps every notification together with the clock time.
///
/// Handy in tests and in the harness for inspecting untracked streams.
#[derive(Clone)]
pub struct Recorder {
    clock: marbles_env::VirtualClock,
    log: Rc<RefCell<Vec<(marbles_env::VirtualTime, Notification)>>>,
}

impl Recorder {
    /// Creates a recorder stamping notifications with `clock.now()`.
    pub fn new(clock: &marbles_env::VirtualClock) -> Self {
        Self {
            clock: clock.clone(),
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Snapshot of the notifications so far.
    pub fn notifications(&self) -> Vec<(marbles_env::VirtualTime, Notification)> {
        self.log.borrow().clone()
    }

    /// Just the data items, with their times.
    pub fn values(&self) -> Vec<(marbles_env::VirtualTime, serde_json::Value)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|(t, n)| match n {
                Notification::Next(Value::Data(v)) => Some((*t, v.clone())),
                _ => None,
            })
            .collect()
    }

    /// True if a completion was recorded.
    pub fn completed(&self) -> bool {
        self.log
            .borrow()
            .iter()
            .any(|(_, n)| matches!(n, Notification::Complete))
    }

    /// Time of the terminal notification, if any.
    pub fn terminated_at(&self) -> Option<marbles_env::VirtualTime> {
        self.log
            .borrow()
            .iter()
            .find(|(_, n)| !matches!(n, Notification::Next(_)))
            .map(|(t, _)| *t)
    }

    fn push(&self, notification: Notification) {
        self.log.borrow_mut().push((self.clock.now(), notification));
    }
}

impl Observer for Recorder {
    fn next(&self, value: Value) {
        self.push(Notification::Next(value));
    }

    fn error(&self, error: StreamError) {
        self.push(Notification::Error(error));
    }

    fn complete(&self) {
        self.push(Notification::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marbles_env::VirtualClock;

    #[test]
    fn test_subscriber_drops_after_complete() {
        let clock = VirtualClock::new();
        let rec = Recorder::new(&clock);

        let source = Observable::new(|sub| {
            sub.next(Value::from(1));
            sub.complete();
            sub.next(Value::from(2));
            sub.error(StreamError::new("late"));
        });
        source.subscribe(rec.clone());

        assert_eq!(
            rec.notifications(),
            vec![(0, Notification::Next(Value::from(1))), (0, Notification::Complete)]
        );
    }

    #[test]
    fn test_closed_children_are_released_by_parent() {
        let parent = Subscription::new();
        let kept = Subscription::new();
        parent.add_child(&kept);
        for _ in 0..50 {
            let child = Subscription::new();
            parent.add_child(&child);
            child.unsubscribe();
        }
        assert_eq!(parent.pending(), 1);

        parent.unsubscribe();
        assert!(kept.is_closed());
        assert_eq!(parent.pending(), 0);
    }

    #[test]
    fn test_child_added_to_closed_parent_is_closed() {
        let parent = Subscription::new();
        parent.unsubscribe();
        let child = Subscription::new();
        parent.add_child(&child);
        assert!(child.is_closed());
    }

    #[test]
    fn test_completed_inner_streams_do_not_accumulate() {
        let clock = VirtualClock::new();
        let down = Subscriber::new(NoopObserver);
        Observable::interval(&clock, 10)
            .merge_map(|v| Observable::of([v]))
            .subscribe_with(down.clone());

        let samples = Rc::new(RefCell::new(Vec::new()));
        for at in [55, 455] {
            let (samples, sub) = (samples.clone(), down.subscription().clone());
            clock.schedule(at, move || samples.borrow_mut().push(sub.pending()));
        }
        let stopper = down.subscription().clone();
        clock.schedule(500, move || stopper.unsubscribe());
        clock.flush();

        let samples = samples.borrow();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], samples[1]);
    }

    #[test]
    fn test_teardowns_run_once_in_order() {
        let sub = Subscription::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            sub.add(move || order.borrow_mut().push(i));
        }

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);

        // Late teardowns run immediately
        let o = order.clone();
        sub.add(move || o.borrow_mut().push(9));
        assert_eq!(*order.borrow(), vec![0, 1, 2, 9]);
    }

    #[test]
    fn test_child_subscription_follows_parent() {
        let parent = Subscription::new();
        let child = Subscription::new();
        parent.add_child(&child);

        parent.unsubscribe();
        assert!(child.is_closed());
    }

    #[test]
    fn test_observable_is_cold() {
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        let source = Observable::new(move |sub| {
            r.set(r.get() + 1);
            sub.complete();
        });

        source.subscribe(NoopObserver);
        source.subscribe(NoopObserver);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_value_numeric_views() {
        assert_eq!(Value::from(3).as_i64(), Some(3));
        assert_eq!(Value::from(3.0).as_i64(), Some(3));
        assert_eq!(Value::from(3.5).as_i64(), None);
        assert_eq!(Value::from("x").as_i64(), None);
        assert!(Value::from(Observable::new(|_| {})).is_stream());
    }
}
