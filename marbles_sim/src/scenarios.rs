//! Demo pipelines for the simulation harness.
//!
//! Each scenario builds a small set of groups in a [`Playground`], mirroring
//! one entry of the playground's demo catalogue.

use marbles_core::stream::Observable;
use marbles_core::{Playground, Value};
use marbles_env::{GroupError, GroupId, VirtualTime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// MRB-001: emit 1,2,3 and complete
    EmitComplete,

    /// MRB-002: replay an upstream group and double it
    ReplayDouble,

    /// MRB-003: dispose an upstream group a reader depends on
    DisposeUpstream,

    /// MRB-004: finite and infinite sources against the event cap
    EventCap,

    /// MRB-005: a stream of three inner streams
    NestedStreams,

    /// MRB-006: delay a replayed group
    Delay,

    /// MRB-007: merge two timed groups
    Merge,

    /// MRB-008: split a group by key
    GroupBy,

    /// MRB-009: running and final sums
    ScanReduce,

    /// MRB-010: merge_map, concat_map and switch_map side by side
    Flattening,

    /// MRB-011: debounce, throttle and audit of a burst
    RateLimiting,

    /// MRB-012: count and time windows
    Windowing,

    /// MRB-013: seeded random timestamps
    SeededBurst,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::EmitComplete,
            ScenarioId::ReplayDouble,
            ScenarioId::DisposeUpstream,
            ScenarioId::EventCap,
            ScenarioId::NestedStreams,
            ScenarioId::Delay,
            ScenarioId::Merge,
            ScenarioId::GroupBy,
            ScenarioId::ScanReduce,
            ScenarioId::Flattening,
            ScenarioId::RateLimiting,
            ScenarioId::Windowing,
            ScenarioId::SeededBurst,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::EmitComplete => "emit_complete",
            ScenarioId::ReplayDouble => "replay_double",
            ScenarioId::DisposeUpstream => "dispose_upstream",
            ScenarioId::EventCap => "event_cap",
            ScenarioId::NestedStreams => "nested_streams",
            ScenarioId::Delay => "delay",
            ScenarioId::Merge => "merge",
            ScenarioId::GroupBy => "group_by",
            ScenarioId::ScanReduce => "scan_reduce",
            ScenarioId::Flattening => "flattening",
            ScenarioId::RateLimiting => "rate_limiting",
            ScenarioId::Windowing => "windowing",
            ScenarioId::SeededBurst => "seeded_burst",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::EmitComplete => "A emits 1,2,3 at frame 0 and completes",
            ScenarioId::ReplayDouble => "B replays A and doubles every value",
            ScenarioId::DisposeUpstream => "A is removed; B must fail looking it up",
            ScenarioId::EventCap => "250 items and an endless interval, both truncated by the cap",
            ScenarioId::NestedStreams => "three inner intervals recorded as nested histories",
            ScenarioId::Delay => "a replayed group shifted 50 frames later",
            ScenarioId::Merge => "two intervals of different periods merged",
            ScenarioId::GroupBy => "numbers split into odd and even inner streams",
            ScenarioId::ScanReduce => "running sum and final sum of one group",
            ScenarioId::Flattening => "merge_map, concat_map and switch_map over the same input",
            ScenarioId::RateLimiting => "debounce, throttle and audit of one burst",
            ScenarioId::Windowing => "count windows and time windows over an interval",
            ScenarioId::SeededBurst => "random timestamps derived from the seed, then filtered",
        }
    }

    /// Adds the scenario's groups to `playground`, in position order.
    pub fn populate(&self, playground: &mut Playground, seed: u64) -> Vec<GroupId> {
        match self {
            ScenarioId::EmitComplete => vec![add_abc(playground)],
            ScenarioId::ReplayDouble | ScenarioId::DisposeUpstream => {
                let a = add_abc(playground);
                let b = playground.add("B", |deps, _, _| Ok(deps.get("A")?.map(|v| int(int_of(&v) * 2))));
                vec![a, b]
            }
            ScenarioId::EventCap => vec![
                playground.add("many", |_, _, _| Ok(Observable::range(0, 250))),
                playground.add("ticks", |_, clock, _| Ok(Observable::interval(clock, 10))),
            ],
            ScenarioId::NestedStreams => vec![playground.add("outer", |_, clock, _| {
                let clock = clock.clone();
                Ok(Observable::of([1, 2, 3]).map(move |v| {
                    let period = int_of(&v) as VirtualTime * 10;
                    Value::Stream(Observable::interval(&clock, period).take(3))
                }))
            })],
            ScenarioId::Delay => vec![
                add_abc(playground),
                playground.add("delayed", |deps, clock, _| Ok(deps.get("A")?.delay(clock, 50))),
            ],
            ScenarioId::Merge => vec![
                playground.add("fast", |_, clock, _| Ok(Observable::interval(clock, 10).take(3))),
                playground.add("slow", |_, clock, _| Ok(Observable::interval(clock, 15).take(3))),
                playground.add("merged", |deps, _, _| Ok(deps.get("fast")?.merge_with(&deps.get("slow")?))),
            ],
            ScenarioId::GroupBy => vec![
                playground.add("numbers", |_, _, _| Ok(Observable::range(1, 6))),
                playground.add("parity", |deps, _, _| {
                    Ok(deps.get("numbers")?.group_by(|v| {
                        if int_of(v) % 2 == 0 {
                            "even".to_string()
                        } else {
                            "odd".to_string()
                        }
                    }))
                }),
            ],
            ScenarioId::ScanReduce => vec![
                playground.add("numbers", |_, _, _| Ok(Observable::of([1, 2, 3, 4]))),
                playground.add("running", |deps, _, _| Ok(deps.get("numbers")?.scan(0, sum))),
                playground.add("total", |deps, _, _| Ok(deps.get("numbers")?.reduce(0, sum))),
            ],
            ScenarioId::Flattening => vec![
                add_abc(playground),
                playground.add("merge_map", |deps, clock, _| {
                    let clock = clock.clone();
                    Ok(deps.get("A")?.merge_map(move |v| {
                        let due = int_of(&v) as VirtualTime * 10;
                        Observable::timer(&clock, due).map(move |_| v.clone())
                    }))
                }),
                playground.add("concat_map", |deps, clock, _| {
                    let clock = clock.clone();
                    Ok(deps.get("A")?.concat_map(move |v| {
                        Observable::interval(&clock, 5).take(2).map(move |_| v.clone())
                    }))
                }),
                playground.add("switch_map", |deps, clock, _| {
                    let clock = clock.clone();
                    Ok(deps.get("A")?.switch_map(move |v| Observable::timer(&clock, 10).map(move |_| v.clone())))
                }),
            ],
            ScenarioId::RateLimiting => vec![
                playground.add("burst", |_, clock, _| {
                    Ok(Observable::timed(
                        clock,
                        vec![
                            (0, Value::from("a")),
                            (2, Value::from("b")),
                            (4, Value::from("c")),
                            (20, Value::from("d")),
                        ],
                        Some(30),
                    ))
                }),
                playground.add("debounced", |deps, clock, _| Ok(deps.get("burst")?.debounce_time(clock, 5))),
                playground.add("throttled", |deps, clock, _| Ok(deps.get("burst")?.throttle_time(clock, 5))),
                playground.add("audited", |deps, clock, _| Ok(deps.get("burst")?.audit_time(clock, 5))),
            ],
            ScenarioId::Windowing => vec![
                playground.add("ticks", |_, clock, _| Ok(Observable::interval(clock, 10).take(6))),
                playground.add("pairs", |deps, _, _| Ok(deps.get("ticks")?.window_count(2))),
                playground.add("spans", |deps, clock, _| Ok(deps.get("ticks")?.window_time(clock, 25))),
            ],
            ScenarioId::SeededBurst => {
                let entries = seeded_entries(seed);
                vec![
                    playground.add("burst", move |_, clock, _| {
                        let timed = entries.iter().map(|(t, v)| (*t, Value::from(*v)));
                        Ok(Observable::timed(clock, timed.collect::<Vec<_>>(), Some(BURST_SPAN)))
                    }),
                    playground.add("even_tens", |deps, _, _| {
                        Ok(deps
                            .get("burst")?
                            .filter(|v| int_of(v) % 2 == 0)
                            .map(|v| int(int_of(&v) * 10)))
                    }),
                ]
            }
        }
    }

    /// Mutation applied after the first full evaluation.
    pub fn mutate(&self, playground: &mut Playground, groups: &[GroupId]) -> Result<(), GroupError> {
        match self {
            ScenarioId::DisposeUpstream => match groups.first() {
                Some(a) => playground.remove(*a),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }
}

/// Length of the seeded burst in frames.
pub const BURST_SPAN: VirtualTime = 200;

/// Number of items in the seeded burst.
pub const BURST_LEN: usize = 20;

/// `(time, value)` pairs of the seeded burst, ordered by time.
pub fn seeded_entries(seed: u64) -> Vec<(VirtualTime, i64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut entries: Vec<(VirtualTime, i64)> = (0..BURST_LEN)
        .map(|_| (rng.gen_range(0..BURST_SPAN), rng.gen_range(0..100)))
        .collect();
    entries.sort_by_key(|(t, _)| *t);
    entries
}

fn add_abc(playground: &mut Playground) -> GroupId {
    playground.add("A", |_, _, _| Ok(Observable::of([1, 2, 3])))
}

fn int(n: i64) -> Value {
    Value::from(n)
}

fn int_of(v: &Value) -> i64 {
    v.as_i64().unwrap_or(0)
}

fn sum(acc: &Value, v: Value) -> Value {
    int(int_of(acc) + int_of(&v))
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "emit_complete" | "emitcomplete" | "scenario_a" | "mrb-001" => Ok(ScenarioId::EmitComplete),
            "replay_double" | "replaydouble" | "scenario_b" | "mrb-002" => Ok(ScenarioId::ReplayDouble),
            "dispose_upstream" | "disposeupstream" | "scenario_c" | "mrb-003" => Ok(ScenarioId::DisposeUpstream),
            "event_cap" | "eventcap" | "cap" | "mrb-004" => Ok(ScenarioId::EventCap),
            "nested_streams" | "nestedstreams" | "nested" | "mrb-005" => Ok(ScenarioId::NestedStreams),
            "delay" | "mrb-006" => Ok(ScenarioId::Delay),
            "merge" | "mrb-007" => Ok(ScenarioId::Merge),
            "group_by" | "groupby" | "mrb-008" => Ok(ScenarioId::GroupBy),
            "scan_reduce" | "scanreduce" | "mrb-009" => Ok(ScenarioId::ScanReduce),
            "flattening" | "mrb-010" => Ok(ScenarioId::Flattening),
            "rate_limiting" | "ratelimiting" | "mrb-011" => Ok(ScenarioId::RateLimiting),
            "windowing" | "windows" | "mrb-012" => Ok(ScenarioId::Windowing),
            "seeded_burst" | "seededburst" | "burst" | "mrb-013" => Ok(ScenarioId::SeededBurst),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
