//! Layer 2: reachability over the `transitions_to` graph.
//!
//! The Done sentinel is not a node; an edge to it makes the source reach Done.
//! Assumes layer 1 passed, so names are unique and all targets exist.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::PipelineConfig;
use crate::pipeline::PipelineState;

use super::{Layer, LayerFindings};

pub fn check(config: &PipelineConfig) -> LayerFindings {
    let mut findings = LayerFindings::new(Layer::Graph);

    let reaches_done = reaching_done(&config.phases);
    for state in &config.phases {
        if !reaches_done.contains(state.name.as_str()) {
            findings.error(
                Some(&state.name),
                format!("Phase '{}' cannot reach Done", state.name),
            );
        }
    }

    let reachable = reachable_from(&config.phases, &config.entry_phase);
    for state in &config.phases {
        if !reachable.contains(state.name.as_str()) {
            findings.error(
                Some(&state.name),
                format!(
                    "Phase '{}' is not reachable from entry phase '{}'",
                    state.name, config.entry_phase
                ),
            );
        }
    }

    findings
}

/// Backward fixed point: seed with direct edges to Done, then absorb any
/// state with an edge into the set until nothing changes.
pub fn reaching_done(states: &[PipelineState]) -> HashSet<&str> {
    let mut reached: HashSet<&str> = states
        .iter()
        .filter(|s| s.transitions_to_done())
        .map(|s| s.name.as_str())
        .collect();

    loop {
        let before = reached.len();
        for state in states {
            if !reached.contains(state.name.as_str())
                && state.state_targets().any(|t| reached.contains(t))
            {
                reached.insert(state.name.as_str());
            }
        }
        if reached.len() == before {
            return reached;
        }
    }
}

/// Forward breadth-first search from `entry`.
pub fn reachable_from<'a>(states: &'a [PipelineState], entry: &str) -> HashSet<&'a str> {
    let by_name: HashMap<&str, &PipelineState> =
        states.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    if let Some(start) = by_name.get(entry) {
        seen.insert(start.name.as_str());
        queue.push_back(*start);
    }

    while let Some(state) = queue.pop_front() {
        for target in state.state_targets() {
            if let Some(next) = by_name.get(target)
                && seen.insert(next.name.as_str())
            {
                queue.push_back(*next);
            }
        }
    }
    seen
}
