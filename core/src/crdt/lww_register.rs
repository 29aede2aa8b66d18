//! LWW-Register: Last-Writer-Wins Register CRDT
//!
//! Holds a `(value, timestamp, replica)` triple. Merge keeps the entry with
//! the larger `(timestamp, replica)` pair; the replica ID breaks timestamp
//! ties deterministically. Two different values under the same pair are
//! ordered by their JSON encoding. Timestamps come from a caller-supplied monotonic
//! source (see [`TimestampSource`](crate::sync::TimestampSource)).
//!
//! # Example
//!
//! ```
//! use meshkit_core::crdt::{Crdt, LwwRegister};
//!
//! let mut a = LwwRegister::new("a".to_string(), 5, "n1");
//! let b = LwwRegister::new("b".to_string(), 5, "n2");
//!
//! a.merge(&b);
//! assert_eq!(a.get(), "b"); // "n2" > "n1"
//! ```

use super::{Crdt, RegisterValue};
use crate::sync::{Timestamp, TimestampSource};
use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Last-writer-wins register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: RegisterValue"))]
pub struct LwwRegister<T: RegisterValue> {
    value: T,
    timestamp: Timestamp,
    replica: ReplicaId,
}

impl<T: RegisterValue> Default for LwwRegister<T> {
    /// Bottom element: any write wins over it
    fn default() -> Self {
        Self {
            value: T::default(),
            timestamp: 0,
            replica: ReplicaId::new(),
        }
    }
}

impl<T: RegisterValue> LwwRegister<T> {
    /// Create a register holding an initial write
    pub fn new(value: T, timestamp: Timestamp, replica: impl Into<ReplicaId>) -> Self {
        Self {
            value,
            timestamp,
            replica: replica.into(),
        }
    }

    /// Write a value if `(timestamp, replica)` beats the current entry
    ///
    /// Returns the delta (the register after the write) when the write wins,
    /// `None` when it loses to the current entry.
    pub fn set(
        &mut self,
        value: T,
        timestamp: Timestamp,
        replica: impl Into<ReplicaId>,
    ) -> Option<LwwRegister<T>> {
        let candidate = LwwRegister::new(value, timestamp, replica);
        if candidate.wins_over(self) {
            *self = candidate.clone();
            Some(candidate)
        } else {
            None
        }
    }

    /// Write a value stamped by `clock`
    ///
    /// The clock first observes the current timestamp so the write is
    /// guaranteed to supersede it.
    pub fn assign(
        &mut self,
        value: T,
        clock: &mut impl TimestampSource,
        replica: impl Into<ReplicaId>,
    ) -> LwwRegister<T> {
        clock.observe(self.timestamp);
        let written = LwwRegister::new(value, clock.now(), replica);
        *self = written.clone();
        written
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Whether the register still holds the bottom element
    pub fn is_unset(&self) -> bool {
        self.timestamp == 0 && self.replica.is_empty()
    }

    /// Lexicographic `(timestamp, replica)` comparison
    pub fn order(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.replica.cmp(&other.replica))
    }

    fn wins_over(&self, other: &Self) -> bool {
        match self.order(other) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.value != other.value && encoded(&self.value) > encoded(&other.value),
        }
    }
}

fn encoded<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

impl<T: RegisterValue> Crdt for LwwRegister<T> {
    type Value = T;

    fn merge(&mut self, other: &Self) {
        // Equal pairs keep self, which makes merge(a, a) == a
        if other.wins_over(self) {
            *self = other.clone();
        }
    }

    fn value(&self) -> T {
        self.value.clone()
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        if self.wins_over(since) {
            Some(self.clone())
        } else {
            None
        }
    }
}
