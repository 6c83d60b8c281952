//! The Event Tracker.
//!
//! Wraps a stream so that every subscription records a bounded [`History`].
//! Items that are streams themselves get tracked recursively into a fresh nested
//! history, which becomes the payload of the parent's event.
//!
//! All recording goes into one [`TrackingSession`], the explicit accumulator of
//! an evaluation run. Recorders live in an arena indexed by [`HistoryIndex`];
//! nesting is expressed by index, and [`TrackingSession::finish`] freezes the
//! arena into immutable, shared histories.

use crate::history::{Event, History, Payload};
use crate::stream::{NoopObserver, Observable, Observer, StreamError, Subscriber, Subscription, Value};
use marbles_env::{EventId, EventIdGenerator, VirtualClock, VirtualTime};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

/// Position of a history in the session arena, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryIndex(pub usize);

enum RecordedPayload {
    Value(serde_json::Value),
    Nested(HistoryIndex),
}

struct RecordedEvent {
    id: EventId,
    time: VirtualTime,
    payload: RecordedPayload,
}

struct HistoryRecorder {
    name: String,
    start_time: VirtualTime,
    end_time: Option<VirtualTime>,
    error: Option<String>,
    events: Vec<RecordedEvent>,
}

struct SessionState {
    clock: VirtualClock,
    ids: EventIdGenerator,
    cap: usize,
    recorders: RefCell<Vec<HistoryRecorder>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

/// Recording context of one evaluation run.
#[derive(Clone)]
pub struct TrackingSession {
    state: Rc<SessionState>,
}

impl std::fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingSession")
            .field("histories", &self.state.recorders.borrow().len())
            .field("cap", &self.state.cap)
            .finish()
    }
}

impl TrackingSession {
    /// Creates a session recording against `clock`, drawing ids from `ids`,
    /// keeping at most `cap` events per history.
    pub fn new(clock: &VirtualClock, ids: &EventIdGenerator, cap: usize) -> Self {
        Self {
            state: Rc::new(SessionState {
                clock: clock.clone(),
                ids: ids.clone(),
                cap,
                recorders: RefCell::new(Vec::new()),
                subscriptions: RefCell::new(Vec::new()),
            }),
        }
    }

    /// The track operator handed to user definitions.
    pub fn tracker(&self) -> Tracker {
        Tracker {
            session: self.clone(),
        }
    }

    /// Tracks `source` under `name` and subscribes to it right away.
    ///
    /// The history is created before subscribing, so its index is known even if
    /// the source terminates synchronously.
    pub fn subscribe_root(&self, source: &Observable, name: &str) -> HistoryIndex {
        let index = self.open(name.to_string());
        let sink = Subscriber::new(NoopObserver);
        self.attach(source, index, sink);
        index
    }

    /// Number of histories created so far.
    pub fn history_count(&self) -> usize {
        self.state.recorders.borrow().len()
    }

    /// Stops every tracked subscription and freezes the recorded histories,
    /// in creation order (index `i` of the result is `HistoryIndex(i)`).
    pub fn finish(&self) -> Vec<Arc<History>> {
        let subscriptions = std::mem::take(&mut *self.state.subscriptions.borrow_mut());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }

        let recorders = std::mem::take(&mut *self.state.recorders.borrow_mut());
        let mut frozen: Vec<Option<Arc<History>>> = vec![None; recorders.len()];
        (0..recorders.len())
            .map(|i| freeze(&recorders, &mut frozen, i))
            .collect()
    }

    fn open(&self, name: String) -> HistoryIndex {
        let mut recorders = self.state.recorders.borrow_mut();
        recorders.push(HistoryRecorder {
            name,
            start_time: self.state.clock.now(),
            end_time: None,
            error: None,
            events: Vec::new(),
        });
        HistoryIndex(recorders.len() - 1)
    }

    fn attach(&self, source: &Observable, index: HistoryIndex, downstream: Subscriber) {
        let upstream = Subscription::new();
        downstream.subscription().add_child(&upstream);
        {
            let mut subscriptions = self.state.subscriptions.borrow_mut();
            subscriptions.push(downstream.subscription().clone());
            subscriptions.push(upstream.clone());
        }

        let observer = TrackingObserver {
            session: self.clone(),
            index,
            downstream,
            upstream: upstream.clone(),
        };
        source.subscribe_with(Subscriber::with_subscription(observer, upstream));
    }

    fn recorded(&self, index: HistoryIndex) -> usize {
        self.state.recorders.borrow()[index.0].events.len()
    }

    fn name_of(&self, index: HistoryIndex) -> String {
        self.state.recorders.borrow()[index.0].name.clone()
    }

    fn push_event(&self, index: HistoryIndex, id: EventId, payload: RecordedPayload) {
        let time = self.state.clock.now();
        self.state.recorders.borrow_mut()[index.0].events.push(RecordedEvent { id, time, payload });
    }
}

fn freeze(recorders: &[HistoryRecorder], frozen: &mut Vec<Option<Arc<History>>>, i: usize) -> Arc<History> {
    if let Some(done) = &frozen[i] {
        return done.clone();
    }
    let recorder = &recorders[i];
    let events = recorder
        .events
        .iter()
        .map(|e| Event {
            id: e.id,
            time: e.time,
            payload: match &e.payload {
                RecordedPayload::Value(v) => Payload::Value(v.clone()),
                RecordedPayload::Nested(inner) => Payload::History(freeze(recorders, frozen, inner.0)),
            },
        })
        .collect();
    let history = Arc::new(History {
        name: recorder.name.clone(),
        start_time: recorder.start_time,
        end_time: recorder.end_time,
        events,
        error: recorder.error.clone(),
    });
    frozen[i] = Some(history.clone());
    history
}

struct TrackingObserver {
    session: TrackingSession,
    index: HistoryIndex,
    downstream: Subscriber,
    upstream: Subscription,
}

impl Observer for TrackingObserver {
    fn next(&self, value: Value) {
        let session = &self.session;
        let ordinal = session.recorded(self.index);
        if ordinal >= session.state.cap {
            self.upstream.unsubscribe();
            return;
        }

        let id = session.state.ids.next_id();
        match &value {
            Value::Data(data) => session.push_event(self.index, id, RecordedPayload::Value(data.clone())),
            Value::Stream(inner) => {
                let nested = session.open(format!("{}[{}]", session.name_of(self.index), ordinal));
                session.push_event(self.index, id, RecordedPayload::Nested(nested));
                session.attach(inner, nested, Subscriber::new(NoopObserver));
            }
        }

        self.downstream.next(value);

        if ordinal + 1 >= session.state.cap {
            trace!(history = %session.name_of(self.index), "event cap reached, unsubscribing source");
            self.upstream.unsubscribe();
            // The history keeps no end time; only consumers see completion
            self.downstream.complete();
        }
    }

    fn error(&self, error: StreamError) {
        self.session.state.recorders.borrow_mut()[self.index.0].error = Some(error.0.clone());
        self.downstream.error(error);
    }

    fn complete(&self) {
        let now = self.session.state.clock.now();
        self.session.state.recorders.borrow_mut()[self.index.0].end_time = Some(now);
        self.downstream.complete();
    }
}

/// The `track` operator available to definitions.
#[derive(Clone, Debug)]
pub struct Tracker {
    session: TrackingSession,
}

impl Tracker {
    /// Returns a stream that records a history named `name` per subscription.
    pub fn track(&self, source: &Observable, name: impl Into<String>) -> Observable {
        let session = self.session.clone();
        let source = source.clone();
        let name: Rc<str> = name.into().into();
        Observable::new(move |down| {
            let index = session.open(name.to_string());
            session.attach(&source, index, down);
        })
    }
}

impl Observable {
    /// Method form of [`Tracker::track`].
    pub fn tracked(&self, tracker: &Tracker, name: impl Into<String>) -> Observable {
        tracker.track(self, name)
    }
}
