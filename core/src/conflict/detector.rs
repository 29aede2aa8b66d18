//! Before/after inspection of merged objects

use super::{Conflict, ConflictClass, ConflictKind};
use crate::crdt::{CrdtValue, EdgeKey, GraphCrdt, LwwRegister, Transition, WorkflowCrdt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Allowed transitions for a workflow object
///
/// States missing from the table accept no outgoing transitions. An empty
/// definition (no `allow` calls) accepts everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    initial: Option<String>,
    allowed: BTreeMap<String, BTreeSet<String>>,
}

impl WorkflowDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require workflows to start in `state`
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Permit `from -> to`
    pub fn allow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.allowed.entry(from.into()).or_default().insert(to.into());
        self
    }

    pub fn is_allowed(&self, from: Option<&str>, to: &str) -> bool {
        match from {
            None => self.initial.as_deref().map_or(true, |initial| initial == to),
            Some(from) => {
                self.allowed.is_empty()
                    || self
                        .allowed
                        .get(from)
                        .map_or(false, |targets| targets.contains(to))
            }
        }
    }

    /// Ordinary transitions the table does not permit
    pub fn violations(&self, workflow: &WorkflowCrdt) -> Vec<Transition> {
        workflow
            .history()
            .into_iter()
            .filter(|t| !t.is_resolution())
            .filter(|t| !self.is_allowed(t.from_state.as_deref(), &t.to_state))
            .collect()
    }
}

/// Inspect `after` (optionally against `before`) for conflicts
///
/// `remote` marks states produced by merging a peer's delta; register
/// overwrites are only reported for those.
pub fn detect(
    object_id: &str,
    before: Option<&CrdtValue>,
    after: &CrdtValue,
    definition: Option<&WorkflowDefinition>,
    remote: bool,
) -> Vec<Conflict> {
    match after {
        CrdtValue::Workflow(workflow) => detect_workflow(object_id, workflow, definition),
        CrdtValue::Graph(graph) => {
            let previous = match before {
                Some(CrdtValue::Graph(previous)) => Some(previous),
                _ => None,
            };
            detect_dangling(object_id, previous, graph)
        }
        CrdtValue::LwwRegister(register) if remote => match before {
            Some(CrdtValue::LwwRegister(previous)) => {
                detect_overwrite(object_id, previous, register)
            }
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn detect_workflow(
    object_id: &str,
    workflow: &WorkflowCrdt,
    definition: Option<&WorkflowDefinition>,
) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = workflow
        .concurrent_conflicts()
        .into_iter()
        .map(|conflict| {
            let states: Vec<&str> = conflict
                .candidates
                .iter()
                .map(|t| t.to_state.as_str())
                .collect();
            Conflict {
                object_id: object_id.to_string(),
                class: ConflictClass::Semantic,
                fingerprint: format!("{}#concurrent#{}", object_id, conflict.fingerprint()),
                description: format!("concurrent transitions to {}", states.join(" / ")),
                kind: ConflictKind::ConcurrentTransition { conflict },
            }
        })
        .collect();

    if let Some(definition) = definition {
        for transition in definition.violations(workflow) {
            conflicts.push(Conflict {
                object_id: object_id.to_string(),
                class: ConflictClass::Semantic,
                fingerprint: format!("{}#invalid#{}", object_id, transition.id),
                description: format!(
                    "transition {} -> {} is not allowed",
                    transition.from_state.as_deref().unwrap_or("<start>"),
                    transition.to_state
                ),
                kind: ConflictKind::InvalidTransition { transition },
            });
        }
    }
    conflicts
}

fn detect_dangling(object_id: &str, before: Option<&GraphCrdt>, after: &GraphCrdt) -> Vec<Conflict> {
    let known: BTreeSet<EdgeKey> = before
        .map(|graph| graph.dangling_edges().into_iter().collect())
        .unwrap_or_default();

    after
        .dangling_edges()
        .into_iter()
        .filter(|edge| !known.contains(edge))
        .map(|edge| Conflict {
            object_id: object_id.to_string(),
            class: ConflictClass::StructuralOnly,
            fingerprint: format!("{}#dangling#{}", object_id, edge),
            description: format!("edge {} lost an endpoint", edge),
            kind: ConflictKind::DanglingEdge { edge },
        })
        .collect()
}

fn detect_overwrite(
    object_id: &str,
    before: &LwwRegister<serde_json::Value>,
    after: &LwwRegister<serde_json::Value>,
) -> Vec<Conflict> {
    if before.is_unset() || before.replica() == after.replica() || before == after {
        return Vec::new();
    }
    let overwritten = (before.timestamp(), before.replica().to_string());
    let winner = (after.timestamp(), after.replica().to_string());
    vec![Conflict {
        object_id: object_id.to_string(),
        class: ConflictClass::StructuralOnly,
        fingerprint: format!(
            "{}#overwrite#{}:{}>{}:{}",
            object_id, overwritten.0, overwritten.1, winner.0, winner.1
        ),
        description: format!(
            "write from {} superseded by write from {}",
            overwritten.1, winner.1
        ),
        kind: ConflictKind::RegisterOverwrite { overwritten, winner },
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Crdt, GCounter};
    use crate::sync::LamportClock;

    fn forked_workflow() -> WorkflowCrdt {
        let mut clock1 = LamportClock::new();
        let mut a = WorkflowCrdt::with_initial("pending", &mut clock1, "n1");
        let mut b = a.clone();
        let mut clock2 = clock1;
        a.advance("approved", &mut clock1, "n1").unwrap();
        b.advance("rejected", &mut clock2, "n2").unwrap();
        a.merge(&b);
        a
    }

    #[test]
    fn test_concurrent_transitions_are_semantic() {
        let value = CrdtValue::from(forked_workflow());
        let conflicts = detect("wf", None, &value, None, true);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].class, ConflictClass::Semantic);
        assert_eq!(conflicts[0].operations().len(), 2);
    }

    #[test]
    fn test_definition_flags_invalid_transition() {
        let mut clock = LamportClock::new();
        let mut wf = WorkflowCrdt::with_initial("draft", &mut clock, "n1");
        wf.advance("published", &mut clock, "n1").unwrap();

        let definition = WorkflowDefinition::new()
            .initial("draft")
            .allow("draft", "review")
            .allow("review", "published");
        let conflicts = detect("wf", None, &CrdtValue::from(wf), Some(&definition), false);

        assert_eq!(conflicts.len(), 1);
        assert!(matches!(
            conflicts[0].kind,
            ConflictKind::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_new_dangling_edge_is_structural() {
        let mut before = GraphCrdt::new();
        before.add_vertex("a", "n1");
        before.add_vertex("b", "n1");
        before.add_edge("a", "b", "n1").unwrap();

        let mut after = before.clone();
        after.remove_vertex("b");

        let conflicts = detect(
            "g",
            Some(&CrdtValue::from(before)),
            &CrdtValue::from(after.clone()),
            None,
            true,
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(ConflictClass::of(&conflicts), ConflictClass::StructuralOnly);

        // Already-known dangling edges are not reported again
        let again = detect(
            "g",
            Some(&CrdtValue::from(after.clone())),
            &CrdtValue::from(after),
            None,
            true,
        );
        assert!(again.is_empty());
    }

    #[test]
    fn test_remote_register_overwrite() {
        let before = LwwRegister::new(serde_json::json!("mine"), 3, "n1");
        let mut after = before.clone();
        after.merge(&LwwRegister::new(serde_json::json!("theirs"), 4, "n2"));

        let before = CrdtValue::from(before);
        let after = CrdtValue::from(after);
        assert_eq!(detect("r", Some(&before), &after, None, true).len(), 1);
        assert!(detect("r", Some(&before), &after, None, false).is_empty());
    }

    #[test]
    fn test_counters_never_conflict() {
        let mut counter = GCounter::new();
        counter.increment("n1", 1);
        let value = CrdtValue::from(counter);
        assert_eq!(ConflictClass::of(&detect("c", None, &value, None, true)), ConflictClass::None);
    }
}
