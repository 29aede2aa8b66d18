//! Conflict resolution engine
//!
//! Structural merge always converges but does not express domain intent.
//! This layer runs after a merge, inspects the before/after state of an
//! object and classifies what it finds:
//!
//! - **None:** nothing to report
//! - **StructuralOnly:** the merge settled it (a dangling graph edge, an
//!   overwritten LWW register); recorded for the audit trail only
//! - **Semantic:** concurrent or disallowed workflow transitions; handed to
//!   the configured strategy (`keep-latest`, `manual-review` or a named
//!   custom resolver)
//!
//! Every detected conflict and its resolution lands in the [`AuditLog`],
//! itself a grow-only CRDT so resolution history replicates like data.

mod audit;
mod detector;
mod engine;
mod strategy;

pub use audit::{AuditEntry, AuditKey, AuditLog, Resolution};
pub use detector::{detect, WorkflowDefinition};
pub use engine::{ConflictEngine, Evaluation};
pub use strategy::{ConflictResolver, Decision, FnResolver, PriorityResolver, StrategyKind};

use crate::crdt::{EdgeKey, Transition, TransitionConflict};
use crate::error::SyncError;
use crate::sync::Timestamp;
use crate::{ObjectId, ReplicaId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of what a merge produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictClass {
    None,
    StructuralOnly,
    Semantic,
}

impl ConflictClass {
    /// Most severe class among `conflicts`
    pub fn of(conflicts: &[Conflict]) -> ConflictClass {
        conflicts
            .iter()
            .map(|c| c.class)
            .max()
            .unwrap_or(ConflictClass::None)
    }
}

impl fmt::Display for ConflictClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictClass::None => "none",
            ConflictClass::StructuralOnly => "structural-only",
            ConflictClass::Semantic => "semantic",
        };
        f.write_str(name)
    }
}

/// What was found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// Transitions from the same predecessor to different states
    ConcurrentTransition { conflict: TransitionConflict },
    /// Transition not allowed by the workflow definition
    InvalidTransition { transition: Transition },
    /// Edge whose endpoint vertex was removed
    DanglingEdge { edge: EdgeKey },
    /// A register write replaced by a write from another replica
    RegisterOverwrite {
        overwritten: (Timestamp, ReplicaId),
        winner: (Timestamp, ReplicaId),
    },
}

/// A detected conflict on one object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub object_id: ObjectId,
    pub class: ConflictClass,
    pub kind: ConflictKind,
    /// Stable identity; the same conflict seen twice has the same fingerprint
    pub fingerprint: String,
    pub description: String,
}

impl Conflict {
    /// Operations in contention, for the audit record
    pub fn operations(&self) -> Vec<serde_json::Value> {
        let ops = match &self.kind {
            ConflictKind::ConcurrentTransition { conflict } => conflict
                .candidates
                .iter()
                .map(serde_json::to_value)
                .collect(),
            ConflictKind::InvalidTransition { transition } => {
                vec![serde_json::to_value(transition)]
            }
            ConflictKind::DanglingEdge { edge } => vec![serde_json::to_value(edge)],
            ConflictKind::RegisterOverwrite { overwritten, winner } => {
                vec![serde_json::to_value(overwritten), serde_json::to_value(winner)]
            }
        };
        ops.into_iter().filter_map(|op| op.ok()).collect()
    }

    pub fn to_error(&self) -> SyncError {
        SyncError::SemanticConflict {
            object_id: self.object_id.clone(),
            description: self.description.clone(),
        }
    }
}
