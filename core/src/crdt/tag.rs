//! Tag: unique identifier for OR-Set adds and time-series entries
//!
//! Each tag is composed of:
//! - Replica ID: identifies the replica that created the tag
//! - Counter: strictly increasing per replica, never reused

use crate::ReplicaId;
use serde::{Deserialize, Serialize};

/// Unique add-tag
///
/// Tags are ordered by replica, then counter, which gives a deterministic
/// total order for tombstone sets and serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    /// Replica that created this tag
    pub replica: ReplicaId,

    /// Per-replica counter at creation time (starts at 1)
    pub counter: u64,
}

impl Tag {
    /// Create a new tag
    pub fn new(replica: impl Into<ReplicaId>, counter: u64) -> Self {
        Self {
            replica: replica.into(),
            counter,
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}
