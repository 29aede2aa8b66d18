//! PN-Counter built from two [`GCounter`]s
//!
//! `increments` and `decrements` each hold one monotonic total per replica,
//! and the value is their difference clamped to `i64`. Merging merges
//! the halves independently, so the counter inherits the G-Counter's join.
//! A delta is a pair of single-replica G-Counter deltas with only the side
//! that moved populated.
//!
//! # Example
//!
//! ```
//! use meshkit_core::crdt::{Crdt, PnCounter};
//!
//! let mut counter1 = PnCounter::new();
//! let mut counter2 = PnCounter::new();
//!
//! // Both replicas increment
//! counter1.increment("replica1", 5);
//! counter2.increment("replica2", 3);
//!
//! // Merge states
//! counter1.merge(&counter2);
//!
//! assert_eq!(counter1.value(), 8);
//! ```

use super::{Crdt, GCounter};
use serde::{Deserialize, Serialize};

/// Counter that can go down as well as up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    /// Increments per replica
    increments: GCounter,

    /// Decrements per replica
    decrements: GCounter,
}

impl PnCounter {
    /// Create a new, zero-valued PN-Counter
    pub fn new() -> Self {
        Self {
            increments: GCounter::new(),
            decrements: GCounter::new(),
        }
    }

    /// Increment the counter by the given amount
    ///
    /// Returns the delta holding only this replica's increment slot.
    pub fn increment(&mut self, replica: &str, amount: u64) -> PnCounter {
        let increments = self.increments.increment(replica, amount);
        PnCounter {
            increments,
            decrements: GCounter::new(),
        }
    }

    /// Decrement the counter by the given amount
    ///
    /// Returns the delta holding only this replica's decrement slot.
    pub fn decrement(&mut self, replica: &str, amount: u64) -> PnCounter {
        let decrements = self.decrements.increment(replica, amount);
        PnCounter {
            increments: GCounter::new(),
            decrements,
        }
    }

    /// Sum of all increments
    pub fn increments(&self) -> &GCounter {
        &self.increments
    }

    /// Sum of all decrements
    pub fn decrements(&self) -> &GCounter {
        &self.decrements
    }
}

impl Crdt for PnCounter {
    type Value = i64;

    /// Returns the sum of all increments minus the sum of all decrements.
    fn value(&self) -> i64 {
        let value = self.increments.value() as i128 - self.decrements.value() as i128;
        value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Merge each G-Counter independently
    fn merge(&mut self, other: &PnCounter) {
        self.increments.merge(&other.increments);
        self.decrements.merge(&other.decrements);
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let increments = self.increments.to_delta(&since.increments);
        let decrements = self.decrements.to_delta(&since.decrements);
        if increments.is_none() && decrements.is_none() {
            return None;
        }
        Some(PnCounter {
            increments: increments.unwrap_or_default(),
            decrements: decrements.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_creation() {
        let counter = PnCounter::new();
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn test_increment() {
        let mut counter = PnCounter::new();
        counter.increment("replica1", 5);
        assert_eq!(counter.value(), 5);

        counter.increment("replica1", 3);
        assert_eq!(counter.value(), 8);
    }

    #[test]
    fn test_decrement() {
        let mut counter = PnCounter::new();
        counter.increment("replica1", 10);
        counter.decrement("replica1", 3);
        assert_eq!(counter.value(), 7);
    }

    #[test]
    fn test_negative_value() {
        let mut counter = PnCounter::new();
        counter.decrement("replica1", 5);
        assert_eq!(counter.value(), -5);
    }

    #[test]
    fn test_merge_different_replicas() {
        let mut counter1 = PnCounter::new();
        let mut counter2 = PnCounter::new();

        counter1.increment("replica1", 10);
        counter1.decrement("replica1", 2);

        counter2.increment("replica2", 5);
        counter2.decrement("replica2", 3);

        counter1.merge(&counter2);

        // (10 - 2) + (5 - 3) = 8 + 2 = 10
        assert_eq!(counter1.value(), 10);
    }

    #[test]
    fn test_merge_idempotence() {
        let mut counter1 = PnCounter::new();
        let mut counter2 = PnCounter::new();
        counter1.increment("replica1", 5);
        counter2.decrement("replica2", 1);

        counter1.merge(&counter2);
        let once = counter1.clone();
        counter1.merge(&counter2);

        // Merging same state twice should have no effect
        assert_eq!(counter1, once);
    }

    #[test]
    fn test_delta_application() {
        let mut local = PnCounter::new();
        let mut remote = PnCounter::new();

        let d1 = local.increment("replica1", 4);
        let d2 = local.decrement("replica1", 1);

        // Deltas delivered out of order and duplicated
        remote.apply_delta(&d2);
        remote.apply_delta(&d1);
        remote.apply_delta(&d2);

        assert_eq!(remote.value(), 3);
        assert_eq!(remote, local);
    }
}
