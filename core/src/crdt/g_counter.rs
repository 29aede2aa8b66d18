//! G-Counter: Grow-only Counter CRDT
//!
//! Each replica owns one slot; the value is the sum of all slots.
//! Merge takes the per-replica maximum.
//!
//! # Example
//!
//! ```
//! use meshkit_core::crdt::{Crdt, GCounter};
//!
//! let mut a = GCounter::new();
//! let mut b = GCounter::new();
//! a.increment("A", 3);
//! b.increment("B", 5);
//!
//! a.merge(&b);
//! assert_eq!(a.value(), 8);
//! ```

use super::Crdt;
use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Grow-only counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    counts: BTreeMap<ReplicaId, u64>,
}

impl GCounter {
    pub fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }

    /// Increment this replica's slot by `amount`
    ///
    /// Returns the delta: a counter holding only the updated slot.
    pub fn increment(&mut self, replica: &str, amount: u64) -> GCounter {
        let slot = self.counts.entry(replica.to_string()).or_insert(0);
        *slot = slot.saturating_add(amount);

        let mut delta = GCounter::new();
        delta.counts.insert(replica.to_string(), *slot);
        delta
    }

    /// Value contributed by one replica
    pub fn replica_value(&self, replica: &str) -> u64 {
        self.counts.get(replica).copied().unwrap_or(0)
    }

    /// Iterate over (replica, count) slots
    pub fn entries(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.counts.iter()
    }
}

impl Crdt for GCounter {
    type Value = u64;

    fn merge(&mut self, other: &Self) {
        for (replica, &count) in &other.counts {
            let current = self.counts.entry(replica.clone()).or_insert(0);
            *current = (*current).max(count);
        }
    }

    fn value(&self) -> u64 {
        self.counts
            .values()
            .fold(0u64, |acc, &count| acc.saturating_add(count))
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let counts: BTreeMap<_, _> = self
            .counts
            .iter()
            .filter(|(replica, &count)| count > since.replica_value(replica))
            .map(|(replica, &count)| (replica.clone(), count))
            .collect();

        if counts.is_empty() {
            None
        } else {
            Some(GCounter { counts })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_different_replicas() {
        let mut a = GCounter::new();
        let mut b = GCounter::new();
        a.increment("A", 3);
        b.increment("B", 5);

        a.merge(&b);
        assert_eq!(a.value(), 8);
    }

    #[test]
    fn test_merge_same_replica_takes_max() {
        let mut a = GCounter::new();
        let mut b = GCounter::new();
        a.increment("A", 5);
        b.increment("A", 3);

        a.merge(&b);
        assert_eq!(a.value(), 5);
    }

    #[test]
    fn test_increment_returns_delta() {
        let mut a = GCounter::new();
        a.increment("A", 2);
        let delta = a.increment("A", 4);

        assert_eq!(delta.value(), 6);
        let mut remote = GCounter::new();
        remote.apply_delta(&delta);
        assert_eq!(remote, a);
    }

    #[test]
    fn test_to_delta_only_newer_slots() {
        let mut a = GCounter::new();
        a.increment("A", 2);
        a.increment("B", 1);
        let since = a.clone();
        a.increment("A", 1);

        let delta = a.to_delta(&since).unwrap();
        assert_eq!(delta.replica_value("A"), 3);
        assert_eq!(delta.replica_value("B"), 0);
        assert!(a.to_delta(&a).is_none());
    }
}
