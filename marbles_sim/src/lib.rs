//! Marbles Scenario Harness
//!
//! This crate drives the engine through the playground's demo catalogue:
//! each scenario builds a pipeline of groups, evaluates it, evaluates it again
//! from scratch, and checks both the expected histories and that the two runs
//! agree event for event.
//!
//! # Usage
//!
//! ```
//! use marbles_sim::{ScenarioId, ScenarioRunner};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::ReplayDouble);
//! assert!(result.passed);
//! ```

mod exporter;
mod runner;
pub mod scenarios;

pub use exporter::{ExportError, GroupExport, PlaygroundExport};
pub use runner::{ScenarioMetrics, ScenarioOutcome, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
