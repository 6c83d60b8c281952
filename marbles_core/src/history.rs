//! Recorded, timestamped output of one tracked stream.

use marbles_env::{EventId, VirtualTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One recorded emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique across the whole process, strictly increasing
    pub id: EventId,

    /// Virtual time of the emission
    pub time: VirtualTime,

    /// The item, or the history of the emitted inner stream
    pub payload: Payload,
}

/// What an event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Plain data item
    Value(serde_json::Value),

    /// The emitted item was itself a stream
    History(Arc<History>),
}

impl Payload {
    /// Data view of the payload.
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::History(_) => None,
        }
    }

    /// Nested history view of the payload.
    pub fn as_history(&self) -> Option<&Arc<History>> {
        match self {
            Self::History(h) => Some(h),
            Self::Value(_) => None,
        }
    }
}

/// Bounded event history of a tracked stream.
///
/// `end_time` is present iff the stream completed normally before the event
/// cap and before the clock horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Display name
    pub name: String,

    /// Clock time at subscription
    pub start_time: VirtualTime,

    /// Clock time at normal completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<VirtualTime>,

    /// Emissions in order
    pub events: Vec<Event>,

    /// Message of the error notification that ended the stream, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl History {
    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// True if the stream completed normally.
    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    /// Data payloads, skipping nested histories.
    pub fn values(&self) -> Vec<&serde_json::Value> {
        self.events.iter().filter_map(|e| e.payload.as_value()).collect()
    }

    /// `(time, value)` pairs of the data payloads.
    pub fn timed_values(&self) -> Vec<(VirtualTime, serde_json::Value)> {
        self.events
            .iter()
            .filter_map(|e| e.payload.as_value().map(|v| (e.time, v.clone())))
            .collect()
    }

    /// Histories nested directly in this one.
    pub fn nested(&self) -> impl Iterator<Item = &Arc<History>> {
        self.events.iter().filter_map(|e| e.payload.as_history())
    }

    /// Every event id in this history and all nested ones.
    pub fn all_ids(&self) -> Vec<EventId> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, into: &mut Vec<EventId>) {
        for event in &self.events {
            into.push(event.id);
            if let Payload::History(inner) = &event.payload {
                inner.collect_ids(into);
            }
        }
    }

    /// Copy with every id (nested included) shifted down by `base`.
    pub fn rebased(&self, base: EventId) -> History {
        History {
            name: self.name.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            events: self
                .events
                .iter()
                .map(|e| Event {
                    id: EventId(e.id.0.saturating_sub(base.0)),
                    time: e.time,
                    payload: match &e.payload {
                        Payload::Value(v) => Payload::Value(v.clone()),
                        Payload::History(h) => Payload::History(Arc::new(h.rebased(base))),
                    },
                })
                .collect(),
            error: self.error.clone(),
        }
    }

    /// Id-independent form: ids rebased so the smallest id in the tree is 0.
    ///
    /// Two runs of the same definition against the same inputs produce equal
    /// canonical histories even though their raw ids differ.
    pub fn canonical(&self) -> History {
        let base = self.all_ids().into_iter().min().unwrap_or(EventId(0));
        self.rebased(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: u64, time: VirtualTime, payload: Payload) -> Event {
        Event {
            id: EventId(id),
            time,
            payload,
        }
    }

    fn sample(offset: u64) -> History {
        let inner = History {
            name: "root[0]".into(),
            start_time: 0,
            end_time: Some(5),
            events: vec![event(offset + 1, 5, Payload::Value(json!("x")))],
            error: None,
        };
        History {
            name: "root".into(),
            start_time: 0,
            end_time: None,
            events: vec![
                event(offset, 0, Payload::History(Arc::new(inner))),
                event(offset + 2, 7, Payload::Value(json!(3))),
            ],
            error: None,
        }
    }

    #[test]
    fn test_canonical_ignores_absolute_ids() {
        let a = sample(10);
        let b = sample(500);
        assert_ne!(a, b);
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical().all_ids(), vec![EventId(0), EventId(1), EventId(2)]);
    }

    #[test]
    fn test_history_views() {
        let h = sample(0);
        assert_eq!(h.len(), 2);
        assert!(!h.is_complete());
        assert_eq!(h.values(), vec![&json!(3)]);
        assert_eq!(h.nested().count(), 1);
        assert_eq!(h.timed_values(), vec![(7, json!(3))]);
    }

    #[test]
    fn test_history_serializes_with_tagged_payloads() {
        let h = sample(0);
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["events"][1]["payload"], json!({"kind": "value", "data": 3}));
        assert_eq!(json["events"][0]["payload"]["kind"], json!("history"));
        assert!(json.get("end_time").is_none());
    }
}
