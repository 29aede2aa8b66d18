//! Causality tracking: vector clocks and timestamp sources
//!
//! Vector clocks are exchanged during the sync handshake as the version
//! vector of each node. Timestamp sources feed LWW registers and time-series
//! ordering.

mod clock;
mod vector_clock;

pub use clock::{LamportClock, SystemClock, Timestamp, TimestampSource};
pub use vector_clock::{ClockOrdering, VectorClock};
