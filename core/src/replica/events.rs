//! Notifications published by the replica store

use crate::conflict::Conflict;
use crate::crdt::CrdtKind;
use crate::ObjectId;
use crate::ReplicaId;

/// Store activity, delivered over a `tokio::sync::broadcast` channel
///
/// Slow subscribers may observe `RecvError::Lagged`; events are
/// notifications, the delta log remains the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A local mutation was logged under `seq`
    DeltaProduced {
        object_id: ObjectId,
        kind: CrdtKind,
        seq: u64,
    },
    /// A remote delta was merged and logged under `seq`
    DeltaApplied {
        object_id: ObjectId,
        origin: ReplicaId,
        seq: u64,
    },
    /// A conflict was recorded in the audit log for the first time
    ConflictDetected { conflict: Conflict },
    /// The instance stopped accepting merges
    InstanceFrozen { object_id: ObjectId, reason: String },
    /// New audit entries, recorded here or merged from a peer
    AuditRecorded { entries: usize },
}

impl StoreEvent {
    /// Object the event concerns (`None` for audit-wide events)
    pub fn object_id(&self) -> Option<&str> {
        match self {
            StoreEvent::DeltaProduced { object_id, .. }
            | StoreEvent::DeltaApplied { object_id, .. }
            | StoreEvent::InstanceFrozen { object_id, .. } => Some(object_id),
            StoreEvent::ConflictDetected { conflict } => Some(&conflict.object_id),
            StoreEvent::AuditRecorded { .. } => None,
        }
    }
}
