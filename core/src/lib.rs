//! MeshKit Core - CRDT engine with gossip synchronization
//!
//! This crate implements:
//! - Primitive CRDTs (G-Counter, PN-Counter, G-Set, OR-Set, LWW-Register)
//! - Specialized CRDTs (time series, graph, workflow)
//! - Conflict detection and resolution with a replicated audit log
//! - A replica store with per-instance locking and a delta log
//! - Delta gossip over any ordered byte stream, with retry and backoff
//!
//! # Examples
//!
//! ```rust
//! use meshkit_core::crdt::{Crdt, GCounter};
//!
//! let mut a = GCounter::new();
//! let mut b = GCounter::new();
//! a.increment("node-a", 3);
//! b.increment("node-b", 5);
//!
//! a.merge(&b);
//! assert_eq!(a.value(), 8);
//! ```

pub mod config;
pub mod conflict;
pub mod crdt;
pub mod error;
pub mod metrics;
pub mod network;
pub mod optimizer;
pub mod protocol;
pub mod replica;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use config::SyncConfig;
pub use crdt::{Crdt, CrdtKind, CrdtValue};
pub use error::{Result, SyncError};
pub use network::SyncNode;
pub use replica::ReplicaStore;
pub use sync::{Timestamp, VectorClock};

/// Replica (node) identifier type
pub type ReplicaId = String;

/// Identifier of a named CRDT instance
pub type ObjectId = String;
