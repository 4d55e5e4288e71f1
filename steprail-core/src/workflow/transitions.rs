//! Transition graph of legal status-to-status moves

use crate::workflow::status::{
    gate_status, running_status, STATUS_CANCELLED, STATUS_COMPLETED, STATUS_FAILED,
    STATUS_RUNNING,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Mapping from a status to the statuses reachable from it in one move
///
/// A status with no outgoing edges is terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMap {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl TransitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style edge insertion
    pub fn allow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.insert(from, to);
        self
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.edges.entry(from.into()).or_default().insert(to.into());
    }

    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.edges
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// Statuses reachable from `from` in one move
    pub fn targets(&self, from: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(from)
            .into_iter()
            .flat_map(|targets| targets.iter().map(String::as_str))
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.edges.get(status).map_or(true, BTreeSet::is_empty)
    }

    /// Every edge as `(from, to)` in sorted order
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (from.as_str(), to.as_str())))
    }

    /// Edges of `required` this map lacks
    pub fn missing_edges<'a>(&self, required: &'a TransitionMap) -> Vec<(&'a str, &'a str)> {
        required
            .edges()
            .filter(|(from, to)| !self.allows(from, to))
            .collect()
    }

    /// Graph a pipeline needs to walk `steps` (name, gated) in order
    ///
    /// Starts at bare `running`; each step is entered through `running:<step>`
    /// or, when gated, `gate:<step>` first. Every active status may move to
    /// `failed` or `cancelled`; the last step (or the start, for an empty
    /// list) may move to `completed`.
    pub fn for_steps<'a>(steps: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        let mut map = TransitionMap::new();
        let mut previous = STATUS_RUNNING.to_string();
        map.insert(STATUS_RUNNING, STATUS_CANCELLED);

        for (name, gated) in steps {
            let running = running_status(name);
            if gated {
                let gate = gate_status(name);
                map.insert(previous.as_str(), gate.as_str());
                map.insert(gate.as_str(), running.as_str());
                map.insert(gate.as_str(), STATUS_FAILED);
                map.insert(gate.as_str(), STATUS_CANCELLED);
            } else {
                map.insert(previous.as_str(), running.as_str());
            }
            map.insert(running.as_str(), STATUS_FAILED);
            map.insert(running.as_str(), STATUS_CANCELLED);
            previous = running;
        }

        map.insert(previous, STATUS_COMPLETED);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_detection() {
        let map = TransitionMap::new().allow("draft", "review").allow("review", "done");
        assert!(!map.is_terminal("draft"));
        assert!(map.is_terminal("done"));
        assert!(map.is_terminal("never-seen"));
    }

    #[test]
    fn test_pipeline_graph_for_plain_and_gated_steps() {
        let map = TransitionMap::for_steps([("plan", false), ("approve", true)]);

        assert!(map.allows("running", "running:plan"));
        assert!(map.allows("running:plan", "gate:approve"));
        assert!(!map.allows("running:plan", "running:approve"));
        assert!(map.allows("gate:approve", "running:approve"));
        assert!(map.allows("gate:approve", "failed"));
        assert!(map.allows("running:approve", "completed"));
        assert!(map.allows("running", "cancelled"));
        assert!(map.is_terminal("completed"));
    }

    #[test]
    fn test_empty_pipeline_completes_from_start() {
        let map = TransitionMap::for_steps(std::iter::empty());
        assert!(map.allows("running", "completed"));
    }

    #[test]
    fn test_missing_edges() {
        let required = TransitionMap::for_steps([("only", false)]);
        let partial = TransitionMap::new().allow("running", "running:only");
        let missing = partial.missing_edges(&required);

        assert!(missing.contains(&("running:only", "completed")));
        assert!(!missing.contains(&("running", "running:only")));
    }
}
