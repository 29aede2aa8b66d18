//! Bytes-on-wire and CPU reductions for the network layer
//!
//! - [`compression`]: pre-merge pending deltas of the same object
//! - [`batching`]: lazy flush policy and frame-size splitting
//!
//! Neither affects correctness; CRDTs tolerate arbitrary delay and
//! reordering of delta delivery.

pub mod batching;
pub mod compression;

pub use batching::{split_by_budget, LazySync};
pub use compression::{compress, CompressionStats, OutboundDelta};
