//! Vector clock for causality tracking
//!
//! Maps each replica to the highest counter observed from it. Used as the
//! version vector in the handshake (highest origin sequence applied per
//! origin replica) and as the causal context of tagged CRDTs.

use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Causal relation between two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Every entry of self is <= other, at least one strictly
    Before,
    /// Every entry of self is >= other, at least one strictly
    After,
    /// Identical clocks
    Equal,
    /// Neither dominates
    Concurrent,
}

/// Vector clock keyed by replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Create an empty vector clock
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Increment the counter for a replica and return the new value
    pub fn tick(&mut self, replica: &str) -> u64 {
        let entry = self.clocks.entry(replica.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Raise the counter for a replica to at least `value`
    pub fn update(&mut self, replica: &str, value: u64) {
        if value == 0 {
            return;
        }
        let entry = self.clocks.entry(replica.to_string()).or_insert(0);
        *entry = (*entry).max(value);
    }

    /// Counter for a replica (0 if never seen)
    pub fn get(&self, replica: &str) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Pointwise maximum
    pub fn merge(&mut self, other: &VectorClock) {
        for (replica, &value) in &other.clocks {
            self.update(replica, value);
        }
    }

    /// Whether the (replica, counter) event is already covered
    pub fn contains(&self, replica: &str, counter: u64) -> bool {
        counter <= self.get(replica)
    }

    /// Compare two clocks for causal ordering
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for replica in self.clocks.keys().chain(other.clocks.keys()) {
            let a = self.get(replica);
            let b = other.get(replica);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Whether self happened strictly before other
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Whether neither clock dominates
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Iterate over (replica, counter) entries in replica order
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Convert to the map shape used by wire messages
    pub fn to_wire(&self) -> HashMap<String, u64> {
        self.clocks
            .iter()
            .map(|(replica, &value)| (replica.clone(), value))
            .collect()
    }

    /// Build from the map shape used by wire messages
    pub fn from_wire(map: &HashMap<String, u64>) -> Self {
        let mut clock = VectorClock::new();
        for (replica, &value) in map {
            clock.update(replica, value);
        }
        clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_and_get() {
        let mut clock = VectorClock::new();
        assert_eq!(clock.get("a"), 0);
        assert_eq!(clock.tick("a"), 1);
        assert_eq!(clock.tick("a"), 2);
        assert_eq!(clock.get("a"), 2);
    }

    #[test]
    fn test_update_never_decreases() {
        let mut clock = VectorClock::new();
        clock.update("a", 5);
        clock.update("a", 3);
        assert_eq!(clock.get("a"), 5);
    }

    #[test]
    fn test_compare() {
        let mut a = VectorClock::new();
        let mut b = VectorClock::new();
        assert_eq!(a.compare(&b), ClockOrdering::Equal);

        a.tick("n1");
        assert_eq!(a.compare(&b), ClockOrdering::After);
        assert!(b.happened_before(&a));

        b.tick("n2");
        assert!(a.is_concurrent(&b));

        b.merge(&a);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut clock = VectorClock::new();
        clock.update("n1", 4);
        clock.update("n2", 9);
        assert_eq!(VectorClock::from_wire(&clock.to_wire()), clock);
    }
}
