//! A single named CRDT instance behind a readers-writer lock

use crate::crdt::{CrdtKind, CrdtValue, CrdtVariant};
use crate::error::{Result, SyncError};
use crate::ObjectId;
use parking_lot::{RwLock, RwLockWriteGuard};

#[derive(Debug)]
pub(crate) struct InstanceState {
    pub value: CrdtValue,
    /// Reason the instance stopped accepting merges
    pub frozen: Option<String>,
}

/// One replicated object
///
/// Reads run concurrently; merges and local mutations take the write lock,
/// so a reader never observes a half-merged composite (e.g. a graph whose
/// vertices were merged but not its edges).
#[derive(Debug)]
pub struct Replica {
    object_id: ObjectId,
    kind: CrdtKind,
    state: RwLock<InstanceState>,
}

impl Replica {
    pub fn new(object_id: impl Into<ObjectId>, value: CrdtValue) -> Self {
        Self {
            object_id: object_id.into(),
            kind: value.kind(),
            state: RwLock::new(InstanceState {
                value,
                frozen: None,
            }),
        }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn kind(&self) -> CrdtKind {
        self.kind
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> CrdtValue {
        self.state.read().value.clone()
    }

    /// Run `f` against the typed state under the read lock
    pub fn read<T: CrdtVariant, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let state = self.state.read();
        Ok(f(state.value.downcast_ref::<T>()?))
    }

    pub fn value_json(&self) -> Result<serde_json::Value> {
        self.state.read().value.value_json()
    }

    pub fn frozen_reason(&self) -> Option<String> {
        self.state.read().frozen.clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.read().frozen.is_some()
    }

    /// Write access for a merge or mutation; fails if frozen
    pub(crate) fn lock_for_write(&self) -> Result<RwLockWriteGuard<'_, InstanceState>> {
        let state = self.state.write();
        if let Some(reason) = &state.frozen {
            return Err(SyncError::Frozen {
                object_id: self.object_id.clone(),
                reason: reason.clone(),
            });
        }
        Ok(state)
    }

    /// Clear the frozen flag after inspection
    ///
    /// The state must validate; otherwise the instance stays frozen.
    pub(crate) fn unfreeze(&self) -> Result<()> {
        let mut state = self.state.write();
        state.value.validate()?;
        state.frozen = None;
        Ok(())
    }

    /// Replace the state wholesale (restore from storage)
    pub(crate) fn replace(&self, value: CrdtValue) -> Result<()> {
        if value.kind() != self.kind {
            return Err(SyncError::TypeMismatch {
                expected: self.kind.as_str(),
                found: value.kind().as_str(),
            });
        }
        let mut state = self.state.write();
        state.value = value;
        state.frozen = None;
        Ok(())
    }
}
