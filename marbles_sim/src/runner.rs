//! Scenario runner - builds, evaluates and checks demo pipelines.

use crate::scenarios::{seeded_entries, ScenarioId, BURST_SPAN};
use marbles_core::{EngineConfig, GroupInfo, GroupRun, History, Playground};
use marbles_env::{GroupError, VirtualTime};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioMetrics {
    /// Live groups after the scenario's mutations
    pub groups: usize,

    /// Groups whose last run failed
    pub failed_groups: usize,

    /// Histories across all groups, nested ones included
    pub histories: usize,

    /// Events across all histories
    pub events: usize,

    /// Driver runs executed (cache hits excluded)
    pub driver_runs: u64,

    /// Latest clock time any group reached
    pub max_final_time: VirtualTime,
}

/// Final state of one scenario execution.
#[derive(Debug)]
pub struct ScenarioOutcome {
    /// The evaluated playground
    pub playground: Playground,

    /// Last run of every live group, in position order
    pub runs: Vec<(GroupInfo, GroupRun)>,
}

impl ScenarioOutcome {
    /// Last run of the group named `name`.
    pub fn run(&self, name: &str) -> Option<&GroupRun> {
        self.runs.iter().find(|(info, _)| info.name == name).map(|(_, run)| run)
    }

    /// Root history of the group named `name`.
    pub fn root(&self, name: &str) -> Result<&Arc<History>, String> {
        let run = self.run(name).ok_or_else(|| format!("group {name} missing"))?;
        match (&run.error, run.root()) {
            (Some(e), _) => Err(format!("group {name} failed: {e}")),
            (None, Some(root)) => Ok(root),
            (None, None) => Err(format!("group {name} produced nothing")),
        }
    }

    fn metrics(&self) -> ScenarioMetrics {
        let mut metrics = ScenarioMetrics {
            groups: self.runs.len(),
            driver_runs: self.playground.runs_executed(),
            ..Default::default()
        };
        for (_, run) in &self.runs {
            if run.error.is_some() {
                metrics.failed_groups += 1;
            }
            metrics.histories += run.histories.len();
            metrics.events += run.histories.iter().map(|h| h.len()).sum::<usize>();
            metrics.max_final_time = metrics.max_final_time.max(run.final_time);
        }
        metrics
    }
}

/// Runs demo scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Engine bounds
    config: EngineConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            config: EngineConfig::default(),
        }
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds and evaluates `scenario` without checking it.
    pub fn execute(&self, scenario: ScenarioId) -> ScenarioOutcome {
        let mut playground = Playground::new(self.config);
        let groups = scenario.populate(&mut playground, self.seed);
        playground.evaluate_all();

        if let Err(e) = scenario.mutate(&mut playground, &groups) {
            warn!("mutation of {} failed: {}", scenario.name(), e);
        }

        let infos = playground.groups();
        let runs = infos
            .into_iter()
            .map(|info| {
                let run = playground.evaluate(info.id);
                (info, run)
            })
            .collect();

        ScenarioOutcome { playground, runs }
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_outcome(scenario).0
    }

    /// Runs a scenario and also hands back the checked evaluation, for export.
    pub fn run_with_outcome(&self, scenario: ScenarioId) -> (ScenarioResult, ScenarioOutcome) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = self.execute(scenario);
        let metrics = outcome.metrics();
        debug!(
            groups = metrics.groups,
            histories = metrics.histories,
            events = metrics.events,
            "scenario evaluated"
        );

        let verdict = self
            .check_determinism(scenario, &outcome)
            .and_then(|_| self.check(scenario, &outcome));

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: verdict.is_ok(),
            failure_reason: verdict.err(),
            metrics,
        };
        (result, outcome)
    }

    /// Re-runs the scenario from scratch and compares every group.
    fn check_determinism(&self, scenario: ScenarioId, first: &ScenarioOutcome) -> Result<(), String> {
        let second = self.execute(scenario);
        if first.runs.len() != second.runs.len() {
            return Err("re-run produced a different number of groups".to_string());
        }
        for ((info, a), (_, b)) in first.runs.iter().zip(&second.runs) {
            if a.error != b.error || a.canonical_histories() != b.canonical_histories() {
                return Err(format!("group {} is not deterministic", info.name));
            }
        }
        Ok(())
    }

    fn check(&self, scenario: ScenarioId, outcome: &ScenarioOutcome) -> Result<(), String> {
        let cap = self.config.event_cap;
        match scenario {
            ScenarioId::EmitComplete => {
                expect_timed(outcome.root("A")?, &[(0, json!(1)), (0, json!(2)), (0, json!(3))])?;
                expect_end(outcome.root("A")?, Some(0))
            }
            ScenarioId::ReplayDouble => {
                expect_timed(outcome.root("B")?, &[(0, json!(2)), (0, json!(4)), (0, json!(6))])?;
                expect_end(outcome.root("B")?, Some(0))
            }
            ScenarioId::DisposeUpstream => {
                let b = outcome.run("B").ok_or("group B missing")?;
                match &b.error {
                    Some(GroupError::DependencyLookup { name }) if name == "A" && b.histories.is_empty() => Ok(()),
                    other => Err(format!("expected lookup error for A, got {other:?}")),
                }
            }
            ScenarioId::EventCap => {
                let many = outcome.root("many")?;
                expect_len(many, cap.min(250))?;
                expect_end(many, if cap > 250 { Some(0) } else { None })?;
                let ticks = outcome.root("ticks")?;
                expect_len(ticks, cap)?;
                expect_end(ticks, None)
            }
            ScenarioId::NestedStreams => {
                let outer = outcome.root("outer")?;
                let nested: Vec<_> = outer.nested().collect();
                if nested.len() != 3 || outer.len() != 3 {
                    return Err(format!("expected 3 nested histories, got {}", nested.len()));
                }
                for (i, inner) in nested.iter().enumerate() {
                    let period = (i as VirtualTime + 1) * 10;
                    expect_timed(inner, &[(period, json!(0)), (2 * period, json!(1)), (3 * period, json!(2))])?;
                    expect_end(inner, Some(3 * period))?;
                }
                Ok(())
            }
            ScenarioId::Delay => {
                let delayed = outcome.root("delayed")?;
                expect_timed(delayed, &[(50, json!(1)), (50, json!(2)), (50, json!(3))])?;
                expect_end(delayed, Some(50))
            }
            ScenarioId::Merge => {
                let merged = outcome.root("merged")?;
                let times: Vec<_> = merged.events.iter().map(|e| e.time).collect();
                if times != [10, 15, 20, 30, 30, 45] {
                    return Err(format!("unexpected merge times {times:?}"));
                }
                expect_end(merged, Some(45))
            }
            ScenarioId::GroupBy => {
                let parity = outcome.root("parity")?;
                let nested: Vec<_> = parity.nested().collect();
                if nested.len() != 2 {
                    return Err(format!("expected 2 groups, got {}", nested.len()));
                }
                expect_values(nested[0], &[json!(1), json!(3), json!(5)])?;
                expect_values(nested[1], &[json!(2), json!(4), json!(6)])
            }
            ScenarioId::ScanReduce => {
                expect_values(outcome.root("running")?, &[json!(1), json!(3), json!(6), json!(10)])?;
                expect_values(outcome.root("total")?, &[json!(10)])
            }
            ScenarioId::Flattening => {
                expect_timed(outcome.root("merge_map")?, &[(10, json!(1)), (20, json!(2)), (30, json!(3))])?;
                expect_timed(
                    outcome.root("concat_map")?,
                    &[
                        (5, json!(1)),
                        (10, json!(1)),
                        (15, json!(2)),
                        (20, json!(2)),
                        (25, json!(3)),
                        (30, json!(3)),
                    ],
                )?;
                expect_timed(outcome.root("switch_map")?, &[(10, json!(3))])
            }
            ScenarioId::RateLimiting => {
                expect_timed(outcome.root("debounced")?, &[(9, json!("c")), (25, json!("d"))])?;
                expect_timed(outcome.root("throttled")?, &[(0, json!("a")), (20, json!("d"))])?;
                expect_timed(outcome.root("audited")?, &[(5, json!("c")), (25, json!("d"))])
            }
            ScenarioId::Windowing => {
                let pairs = outcome.root("pairs")?;
                let sizes: Vec<_> = pairs.nested().map(|h| h.len()).collect();
                if sizes != [2, 2, 2, 0] {
                    return Err(format!("unexpected count windows {sizes:?}"));
                }
                let spans = outcome.root("spans")?;
                let total: usize = spans.nested().map(|h| h.len()).sum();
                if spans.len() != 3 || total != 6 {
                    return Err(format!("unexpected time windows: {} windows, {} items", spans.len(), total));
                }
                Ok(())
            }
            ScenarioId::SeededBurst => {
                let entries = seeded_entries(self.seed);
                let expected: Vec<_> = entries.iter().take(cap).map(|(t, v)| (*t, json!(v))).collect();
                let burst = outcome.root("burst")?;
                expect_timed(burst, &expected)?;
                if entries.len() < cap {
                    expect_end(burst, Some(BURST_SPAN))?;
                }
                let evens = expected.iter().filter(|(_, v)| v.as_i64().is_some_and(|n| n % 2 == 0)).count();
                expect_len(outcome.root("even_tens")?, evens.min(cap))
            }
        }
    }
}

fn expect_timed(history: &History, expected: &[(VirtualTime, serde_json::Value)]) -> Result<(), String> {
    let actual = history.timed_values();
    if actual != expected {
        return Err(format!("{}: expected {:?}, got {:?}", history.name, expected, actual));
    }
    Ok(())
}

fn expect_values(history: &History, expected: &[serde_json::Value]) -> Result<(), String> {
    let actual: Vec<_> = history.values().into_iter().cloned().collect();
    if actual != expected {
        return Err(format!("{}: expected values {:?}, got {:?}", history.name, expected, actual));
    }
    Ok(())
}

fn expect_len(history: &History, expected: usize) -> Result<(), String> {
    if history.len() != expected {
        return Err(format!("{}: expected {} events, got {}", history.name, expected, history.len()));
    }
    Ok(())
}

fn expect_end(history: &History, expected: Option<VirtualTime>) -> Result<(), String> {
    if history.end_time != expected {
        return Err(format!("{}: expected end {:?}, got {:?}", history.name, expected, history.end_time));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_scenario_passes_with_defaults() {
        let runner = ScenarioRunner::new(42);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_small_cap_still_passes() {
        let runner = ScenarioRunner::new(7).with_config(EngineConfig::default().with_event_cap(10));
        for scenario in [ScenarioId::EventCap, ScenarioId::SeededBurst] {
            let result = runner.run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_dispose_scenario_reports_one_failed_group() {
        let result = ScenarioRunner::new(1).run(ScenarioId::DisposeUpstream);
        assert!(result.passed);
        assert_eq!(result.metrics.groups, 1);
        assert_eq!(result.metrics.failed_groups, 1);
    }

    #[test]
    fn test_run_with_outcome_returns_checked_evaluation() {
        let runner = ScenarioRunner::new(5);
        let (result, outcome) = runner.run_with_outcome(ScenarioId::ReplayDouble);

        assert!(result.passed);
        assert_eq!(outcome.runs.len(), result.metrics.groups);
        assert_eq!(outcome.playground.runs_executed(), result.metrics.driver_runs);
        assert!(outcome.root("B").is_ok());
    }

    #[test]
    fn test_metrics_count_nested_histories() {
        let result = ScenarioRunner::new(1).run(ScenarioId::NestedStreams);
        assert_eq!(result.metrics.histories, 4);
        assert_eq!(result.metrics.events, 3 + 9);
        assert_eq!(result.metrics.max_final_time, 90);
    }
}
