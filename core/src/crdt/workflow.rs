//! WorkflowCRDT: replicated state machine with an auditable transition history
//!
//! - `state`: LWW-Register holding the current head (state tag + transition)
//! - `history`: G-Set of every recorded transition, each tagged with its
//!   causal predecessor
//!
//! Two transitions that share a predecessor but propose different states
//! were made concurrently; merge keeps both and the register's LWW rule picks
//! the visible state. [`WorkflowCrdt::concurrent_conflicts`] reports such
//! branches so the conflict engine can audit and resolve them. Resolution is
//! itself a transition (carrying `resolves`), so it replicates like any
//! other write.

use super::{Crdt, GSet, LwwRegister, Tag};
use crate::error::{Result, SyncError};
use crate::sync::{Timestamp, TimestampSource, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of a recorded transition
pub type TransitionId = Tag;

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    /// Transition this one builds on (`None` for the initial state)
    pub predecessor: Option<TransitionId>,
    /// State of the predecessor when this transition was made
    pub from_state: Option<String>,
    pub to_state: String,
    pub timestamp: Timestamp,
    /// Conflicting transitions settled by this one (empty for ordinary writes)
    pub resolves: BTreeSet<TransitionId>,
}

impl Transition {
    pub fn is_resolution(&self) -> bool {
        !self.resolves.is_empty()
    }

    /// LWW order key: `(timestamp, replica)`, counter as final tie-break
    fn order_key(&self) -> (Timestamp, &str, u64) {
        (self.timestamp, self.id.replica.as_str(), self.id.counter)
    }
}

/// Current head of the workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHead {
    pub state: String,
    pub transition: Option<TransitionId>,
}

/// Concurrent transitions from the same predecessor to different states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionConflict {
    pub predecessor: Option<TransitionId>,
    /// Competing transitions in LWW order (last one wins by default)
    pub candidates: Vec<Transition>,
}

impl TransitionConflict {
    /// Candidate the LWW rule selects
    pub fn lww_winner(&self) -> Option<&Transition> {
        self.candidates.last()
    }

    pub fn candidate_ids(&self) -> BTreeSet<TransitionId> {
        self.candidates.iter().map(|t| t.id.clone()).collect()
    }

    /// Stable identity used to deduplicate audit records
    pub fn fingerprint(&self) -> String {
        let predecessor = self
            .predecessor
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "genesis".to_string());
        let ids: Vec<String> = self.candidates.iter().map(|t| t.id.to_string()).collect();
        format!("{}|{}", predecessor, ids.join(","))
    }
}

/// Replicated workflow state machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCrdt {
    state: LwwRegister<WorkflowHead>,
    history: GSet<Transition>,
    context: VectorClock,
}

impl WorkflowCrdt {
    /// Empty workflow (no state yet)
    pub fn new() -> Self {
        Self::default()
    }

    /// Workflow with a recorded initial state
    pub fn with_initial(
        state: impl Into<String>,
        clock: &mut impl TimestampSource,
        replica: &str,
    ) -> Self {
        let mut workflow = Self::new();
        workflow.record(None, state.into(), BTreeSet::new(), clock, replica, true);
        workflow
    }

    /// Move to `new_state`, building on transition `predecessor`
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the predecessor is not in the history.
    pub fn transition(
        &mut self,
        new_state: impl Into<String>,
        predecessor: Option<&TransitionId>,
        clock: &mut impl TimestampSource,
        replica: &str,
    ) -> Result<WorkflowCrdt> {
        if let Some(id) = predecessor {
            if self.find(id).is_none() {
                return Err(SyncError::InvalidOperation(format!(
                    "unknown predecessor transition {}",
                    id
                )));
            }
        }
        Ok(self.record(
            predecessor.cloned(),
            new_state.into(),
            BTreeSet::new(),
            clock,
            replica,
            true,
        ))
    }

    /// Move to `new_state` from the current head
    pub fn advance(
        &mut self,
        new_state: impl Into<String>,
        clock: &mut impl TimestampSource,
        replica: &str,
    ) -> Result<WorkflowCrdt> {
        let head = self.head();
        self.transition(new_state, head.as_ref(), clock, replica)
    }

    /// Settle a conflict by recording `chosen_state` as its outcome
    ///
    /// The visible state only changes when the head is still one of the
    /// competing transitions; once the workflow has moved past the conflict
    /// the resolution is recorded in the history alone.
    pub fn resolve(
        &mut self,
        conflict: &TransitionConflict,
        chosen_state: &str,
        clock: &mut impl TimestampSource,
        replica: &str,
    ) -> WorkflowCrdt {
        let ids = conflict.candidate_ids();
        let predecessor = conflict
            .candidates
            .iter()
            .rev()
            .find(|t| t.to_state == chosen_state)
            .or_else(|| conflict.lww_winner())
            .map(|t| t.id.clone());

        let head_in_conflict = self
            .head()
            .map(|head| ids.contains(&head))
            .unwrap_or(false);
        let update_head = head_in_conflict && self.current_state().as_deref() != Some(chosen_state);

        self.record(
            predecessor,
            chosen_state.to_string(),
            ids,
            clock,
            replica,
            update_head,
        )
    }

    fn record(
        &mut self,
        predecessor: Option<TransitionId>,
        to_state: String,
        resolves: BTreeSet<TransitionId>,
        clock: &mut impl TimestampSource,
        replica: &str,
        update_head: bool,
    ) -> WorkflowCrdt {
        let counter = self.context.tick(replica);
        let id = Tag::new(replica, counter);
        let from_state = predecessor
            .as_ref()
            .and_then(|p| self.find(p))
            .map(|t| t.to_state.clone());

        let mut delta = WorkflowCrdt::new();
        let timestamp = if update_head {
            let written = self.state.assign(
                WorkflowHead {
                    state: to_state.clone(),
                    transition: Some(id.clone()),
                },
                clock,
                replica,
            );
            let timestamp = written.timestamp();
            delta.state = written;
            timestamp
        } else {
            clock.observe(self.state.timestamp());
            clock.now()
        };

        let transition = Transition {
            id,
            predecessor,
            from_state,
            to_state,
            timestamp,
            resolves,
        };
        self.history.insert(transition.clone());
        delta.history.insert(transition);
        delta.context.update(replica, counter);
        delta
    }

    /// Current state tag (`None` before the first transition)
    pub fn current_state(&self) -> Option<String> {
        if self.state.is_unset() {
            None
        } else {
            Some(self.state.get().state.clone())
        }
    }

    /// Transition that produced the current state
    pub fn head(&self) -> Option<TransitionId> {
        self.state.get().transition.clone()
    }

    /// Register entry backing the current state
    pub fn head_register(&self) -> &LwwRegister<WorkflowHead> {
        &self.state
    }

    pub fn find(&self, id: &TransitionId) -> Option<&Transition> {
        self.history.iter().find(|t| &t.id == id)
    }

    /// Audit trail: every transition in `(timestamp, replica)` order
    pub fn history(&self) -> Vec<Transition> {
        let mut transitions: Vec<Transition> = self.history.iter().cloned().collect();
        transitions.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        transitions
    }

    /// Unresolved groups of concurrent transitions with differing targets
    pub fn concurrent_conflicts(&self) -> Vec<TransitionConflict> {
        let mut groups: BTreeMap<Option<&TransitionId>, Vec<&Transition>> = BTreeMap::new();
        for transition in self.history.iter().filter(|t| !t.is_resolution()) {
            groups
                .entry(transition.predecessor.as_ref())
                .or_default()
                .push(transition);
        }

        let resolved: Vec<&BTreeSet<TransitionId>> = self
            .history
            .iter()
            .filter(|t| t.is_resolution())
            .map(|t| &t.resolves)
            .collect();

        let mut conflicts = Vec::new();
        for (predecessor, mut members) in groups {
            let targets: BTreeSet<&str> = members.iter().map(|t| t.to_state.as_str()).collect();
            if members.len() < 2 || targets.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
            let ids: BTreeSet<TransitionId> = members.iter().map(|t| t.id.clone()).collect();
            if resolved.iter().any(|settled| ids.is_subset(settled)) {
                continue;
            }
            conflicts.push(TransitionConflict {
                predecessor: predecessor.cloned(),
                candidates: members.into_iter().cloned().collect(),
            });
        }
        conflicts
    }
}

impl Crdt for WorkflowCrdt {
    type Value = Option<String>;

    fn merge(&mut self, other: &Self) {
        self.state.merge(&other.state);
        self.history.merge(&other.history);
        self.context.merge(&other.context);
    }

    fn value(&self) -> Option<String> {
        self.current_state()
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let state = self.state.to_delta(&since.state);
        let history = self.history.to_delta(&since.history);
        let mut context = VectorClock::new();
        for (replica, &counter) in self.context.iter() {
            if counter > since.context.get(replica) {
                context.update(replica, counter);
            }
        }

        if state.is_none() && history.is_none() && context.is_empty() {
            return None;
        }
        Some(WorkflowCrdt {
            state: state.unwrap_or_default(),
            history: history.unwrap_or_default(),
            context,
        })
    }

    fn validate(&self) -> Result<()> {
        let mut ids = BTreeSet::new();
        for transition in self.history.iter() {
            if !ids.insert(&transition.id) {
                return Err(SyncError::InvariantViolation(format!(
                    "transition id {} reused",
                    transition.id
                )));
            }
            if !self.context.contains(&transition.id.replica, transition.id.counter) {
                return Err(SyncError::InvariantViolation(format!(
                    "transition id {} is ahead of the causal context",
                    transition.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::LamportClock;

    #[test]
    fn test_linear_transitions() {
        let mut clock = LamportClock::new();
        let mut wf = WorkflowCrdt::with_initial("draft", &mut clock, "n1");
        wf.advance("review", &mut clock, "n1").unwrap();
        wf.advance("published", &mut clock, "n1").unwrap();

        assert_eq!(wf.current_state().as_deref(), Some("published"));
        let states: Vec<String> = wf.history().into_iter().map(|t| t.to_state).collect();
        assert_eq!(states, vec!["draft", "review", "published"]);
        assert!(wf.concurrent_conflicts().is_empty());
    }

    #[test]
    fn test_unknown_predecessor_rejected() {
        let mut clock = LamportClock::new();
        let mut wf = WorkflowCrdt::new();
        let bogus = Tag::new("n9", 42);
        assert!(wf.transition("x", Some(&bogus), &mut clock, "n1").is_err());
    }

    #[test]
    fn test_concurrent_transitions_detected() {
        let mut clock1 = LamportClock::new();
        let mut a = WorkflowCrdt::with_initial("pending", &mut clock1, "n1");
        let mut b = a.clone();
        let mut clock2 = clock1;

        a.advance("approved", &mut clock1, "n1").unwrap();
        b.advance("rejected", &mut clock2, "n2").unwrap();

        a.merge(&b);
        b.merge(&a);
        assert_eq!(a, b);

        let conflicts = a.concurrent_conflicts();
        assert_eq!(conflicts.len(), 1);
        let states: Vec<&str> = conflicts[0]
            .candidates
            .iter()
            .map(|t| t.to_state.as_str())
            .collect();
        assert_eq!(states, vec!["approved", "rejected"]);
        // Same timestamp: "n2" breaks the tie
        assert_eq!(a.current_state().as_deref(), Some("rejected"));
    }

    #[test]
    fn test_same_target_is_not_a_conflict() {
        let mut clock1 = LamportClock::new();
        let mut a = WorkflowCrdt::with_initial("pending", &mut clock1, "n1");
        let mut b = a.clone();
        let mut clock2 = clock1;

        a.advance("approved", &mut clock1, "n1").unwrap();
        b.advance("approved", &mut clock2, "n2").unwrap();
        a.merge(&b);
        assert!(a.concurrent_conflicts().is_empty());
    }

    #[test]
    fn test_resolution_settles_conflict() {
        let mut clock1 = LamportClock::new();
        let mut a = WorkflowCrdt::with_initial("pending", &mut clock1, "n1");
        let mut b = a.clone();
        let mut clock2 = clock1;
        a.advance("approved", &mut clock1, "n1").unwrap();
        b.advance("rejected", &mut clock2, "n2").unwrap();
        a.merge(&b);

        let conflict = a.concurrent_conflicts().remove(0);
        let delta = a.resolve(&conflict, "approved", &mut clock1, "n1");

        assert!(a.concurrent_conflicts().is_empty());
        assert_eq!(a.current_state().as_deref(), Some("approved"));

        b.merge(&delta);
        b.merge(&a);
        assert!(b.concurrent_conflicts().is_empty());
        assert_eq!(b.current_state().as_deref(), Some("approved"));
    }

    #[test]
    fn test_validate_detects_id_reuse() {
        let mut clock = LamportClock::new();
        let a = WorkflowCrdt::with_initial("x", &mut clock, "n1");
        let mut clock = LamportClock::new();
        let b = WorkflowCrdt::with_initial("y", &mut clock, "n1");

        let mut merged = a.clone();
        merged.merge(&b);
        assert!(matches!(
            merged.validate(),
            Err(SyncError::InvariantViolation(_))
        ));
    }
}
