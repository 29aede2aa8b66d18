//! Timestamp sources for LWW ordering
//!
//! LWW registers and time-series entries need a caller-supplied, strictly
//! increasing timestamp. Two sources are provided: a logical Lamport clock
//! and a wall clock that never goes backwards.

use serde::{Deserialize, Serialize};

/// Timestamp type used by LWW registers and time series
pub type Timestamp = u64;

/// Source of monotonic timestamps
pub trait TimestampSource {
    /// Next timestamp; strictly greater than every value returned before
    fn now(&mut self) -> Timestamp;

    /// Fold in a timestamp observed from a remote replica
    fn observe(&mut self, remote: Timestamp);
}

impl<T: TimestampSource + ?Sized> TimestampSource for Box<T> {
    fn now(&mut self) -> Timestamp {
        (**self).now()
    }

    fn observe(&mut self, remote: Timestamp) {
        (**self).observe(remote)
    }
}

/// Lamport timestamp for causality tracking
///
/// # Properties
///
/// - Monotonically increasing: clock never decreases
/// - Starts at 0, first tick returns 1
/// - Update on merge: clock = max(local, remote)
///
/// # Example
///
/// ```rust
/// use meshkit_core::sync::LamportClock;
///
/// let mut clock = LamportClock::new();
/// assert_eq!(clock.tick(), 1);
///
/// clock.update(5);  // Merge from remote
/// assert_eq!(clock.tick(), 6);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    /// Create a new Lamport clock starting at 0
    pub fn new() -> Self {
        Self { value: 0 }
    }

    /// Get the current clock value
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Increment clock and return new value (for local operations)
    pub fn tick(&mut self) -> u64 {
        self.value += 1;
        self.value
    }

    /// Update clock from remote timestamp (for merge operations)
    pub fn update(&mut self, remote: u64) {
        self.value = self.value.max(remote);
    }
}

impl TimestampSource for LamportClock {
    fn now(&mut self) -> Timestamp {
        self.tick()
    }

    fn observe(&mut self, remote: Timestamp) {
        self.update(remote);
    }
}

/// Wall-clock timestamps in milliseconds since the Unix epoch
///
/// If the system clock stalls or steps backwards, the last issued value is
/// bumped by one so the sequence stays strictly increasing.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    last: Timestamp,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    fn wall_millis() -> Timestamp {
        chrono::Utc::now().timestamp_millis().max(0) as Timestamp
    }
}

impl TimestampSource for SystemClock {
    fn now(&mut self) -> Timestamp {
        let next = Self::wall_millis().max(self.last + 1);
        self.last = next;
        next
    }

    fn observe(&mut self, remote: Timestamp) {
        self.last = self.last.max(remote);
    }
}
