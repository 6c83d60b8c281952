//! JSON exporter for timeline rendering.
//!
//! Exports every group's canonical histories so an external renderer can draw
//! marble diagrams without running the engine.

use crate::runner::{ScenarioOutcome, ScenarioResult};
use marbles_core::History;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use thiserror::Error;

/// Failure writing an export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One group of the exported pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupExport {
    /// Group name
    pub name: String,

    /// Position in the pipeline
    pub index: usize,

    /// Error message of the last run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Error kind tag of the last run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    /// Names the group may reference
    pub visible: Vec<String>,

    /// Histories with run-relative ids, root first
    pub histories: Vec<History>,
}

/// Complete scenario export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaygroundExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Groups in position order
    pub groups: Vec<GroupExport>,

    /// Final results
    pub passed: bool,

    /// Failure message if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl PlaygroundExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            groups: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Captures every group of an evaluated scenario.
    pub fn from_outcome(outcome: &mut ScenarioOutcome, result: &ScenarioResult) -> Self {
        let mut export = Self::new(result.scenario.name(), result.seed);
        let runs = outcome.runs.clone();
        for (index, (info, run)) in runs.into_iter().enumerate() {
            let visible = outcome.playground.visible_names(info.id).unwrap_or_default();
            export.add_group(GroupExport {
                name: info.name,
                index,
                error: run.error.as_ref().map(|e| e.to_string()),
                error_kind: run.error.as_ref().map(|e| e.kind().to_string()),
                visible,
                histories: run.canonical_histories(),
            });
        }
        export.finalize(result.passed, result.failure_reason.clone());
        export
    }

    /// Adds a group.
    pub fn add_group(&mut self, group: GroupExport) {
        self.groups.push(group);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScenarioRunner;
    use crate::scenarios::ScenarioId;

    #[test]
    fn test_export_carries_errors_and_visibility() {
        let runner = ScenarioRunner::new(3);
        let (result, mut outcome) = runner.run_with_outcome(ScenarioId::ReplayDouble);
        let export = PlaygroundExport::from_outcome(&mut outcome, &result);

        assert!(export.passed);
        assert_eq!(export.groups.len(), 2);
        assert_eq!(export.groups[1].visible, vec!["A"]);
        assert_eq!(export.groups[1].histories[0].events[0].id.0, 0);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["groups"][0]["histories"][0]["name"], "A");
        assert!(json.get("failure_reason").is_none());
    }

    #[test]
    fn test_export_of_failed_group() {
        let runner = ScenarioRunner::new(3);
        let (result, mut outcome) = runner.run_with_outcome(ScenarioId::DisposeUpstream);
        let export = PlaygroundExport::from_outcome(&mut outcome, &result);

        let b = &export.groups[0];
        assert_eq!(b.error_kind.as_deref(), Some("dependency_lookup"));
        assert!(b.histories.is_empty());
        assert!(b.visible.is_empty());
    }

    #[test]
    fn test_write_to_file() {
        let path = std::env::temp_dir().join("marbles_export_test.json");
        let export = PlaygroundExport::new("emit_complete", 1);
        export.write_to_file(path.to_str().unwrap()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: PlaygroundExport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.scenario, "emit_complete");
        let _ = std::fs::remove_file(path);
    }
}
