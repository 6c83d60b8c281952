//! Marbles Core - Deterministic Evaluation of Interdependent Stream Pipelines
//!
//! A pipeline is a list of named groups. Each group's definition builds a
//! stream, possibly from the recorded output of groups positioned before it,
//! and the engine turns that stream into timestamped event histories:
//! 1. **Determinism**: every run gets a private [`VirtualClock`](marbles_env::VirtualClock),
//!    flushed to completion before results are returned
//! 2. **Boundedness**: histories are capped per stream and the clock has a horizon
//! 3. **Isolation**: errors and panics stay inside the group that raised them
//!
//! # Example
//!
//! ```
//! use marbles_core::{Playground, Value};
//! use marbles_core::stream::Observable;
//!
//! let mut playground = Playground::default();
//! playground.add("A", |_, _, _| Ok(Observable::of([1, 2, 3])));
//! let b = playground.add("B", |deps, _, _| {
//!     Ok(deps.get("A")?.map(|v| Value::from(v.as_i64().unwrap_or(0) * 2)))
//! });
//!
//! let run = playground.evaluate(b);
//! let root = run.root().unwrap();
//! assert_eq!(root.values(), vec![&serde_json::json!(2), &serde_json::json!(4), &serde_json::json!(6)]);
//! assert_eq!(root.end_time, Some(0));
//! ```

pub mod config;
pub mod driver;
pub mod flattening;
pub mod history;
pub mod operators;
pub mod playground;
pub mod registry;
pub mod resolver;
pub mod sources;
pub mod store;
pub mod stream;
pub mod timing;
pub mod tracking;

// Re-export key types for convenience
pub use config::{EngineConfig, DEFAULT_EVENT_CAP};
pub use driver::GroupRun;
pub use flattening::Subject;
pub use history::{Event, History, Payload};
pub use playground::{GroupInfo, Playground};
pub use registry::{definition, Definition, Group, GroupRegistry, PositionKey};
pub use resolver::{DependencyAccess, DependencyView, VisibleSet};
pub use store::{replay, HistoryStore};
pub use stream::{Observable, Observer, StreamError, Subscription, Value};
pub use tracking::{Tracker, TrackingSession};
