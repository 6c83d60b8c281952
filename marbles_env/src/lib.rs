//! Marbles Environment Layer
//!
//! This crate provides the deterministic "world" every stream pipeline is
//! evaluated in. Nothing inside a pipeline run may observe real time or any
//! other source of non-determinism:
//! - **Time**: a private [`VirtualClock`] per evaluation run, flushed to a horizon
//! - **Identity**: [`EventIdGenerator`] hands out strictly increasing event ids
//! - **Failure**: the [`GroupError`] taxonomy every group boundary reports with
//!
//! # Example
//!
//! ```
//! use marbles_env::VirtualClock;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let clock = VirtualClock::new();
//! let seen = Rc::new(RefCell::new(Vec::new()));
//!
//! let log = seen.clone();
//! let inner = clock.clone();
//! clock.schedule(10, move || log.borrow_mut().push(inner.now()));
//!
//! clock.flush();
//! assert_eq!(*seen.borrow(), vec![10]);
//! ```

mod clock;
mod error;
mod ids;
mod types;

pub use clock::{FlushOutcome, ScheduledAction, VirtualClock, DEFAULT_HORIZON};
pub use error::GroupError;
pub use ids::{EventId, EventIdGenerator};
pub use types::{GroupId, VirtualTime};
