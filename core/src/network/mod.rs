//! Network synchronization layer
//!
//! Moves deltas between peers over any ordered byte stream:
//!
//! - **Handshake**: identity, protocol version, capabilities and version
//!   vector; fails closed
//! - **Delta sync**: per-peer ack watermarks; a round sends only what the
//!   peer has not acknowledged
//! - **Gossip**: received deltas are relayed to a random fan-out of other
//!   peers, bounded by a hop budget
//! - **Retry/backoff**: timed-out rounds are retried with exponential
//!   backoff; exhausted peers sit out a number of rounds, then are retried
//!
//! # Example
//!
//! ```no_run
//! use meshkit_core::config::SyncConfig;
//! use meshkit_core::network::SyncNode;
//!
//! # async fn run() -> meshkit_core::Result<()> {
//! let a = SyncNode::from_config(SyncConfig::from_toml_str("replica_id = \"a\"")?)?;
//! let b = SyncNode::from_config(SyncConfig::from_toml_str("replica_id = \"b\"")?)?;
//!
//! let (left, right) = tokio::io::duplex(64 * 1024);
//! let (ab, ba) = tokio::join!(a.connect(left, Some("b")), b.connect(right, Some("a")));
//! ab?;
//! ba?;
//!
//! a.start();
//! b.start();
//! # Ok(())
//! # }
//! ```

mod gossip;
mod handshake;
mod node;
mod peer;
mod retry;
mod transport;

pub use gossip::{outgoing_for, select_targets, Outgoing};
pub use handshake::{handshake, validate_hello};
pub use node::{RoundReport, SyncNode};
pub use peer::{FailureOutcome, PeerEntry, PeerState, PeerTable};
pub use retry::RetryPolicy;
pub use transport::{BoxedStream, Dialer, PeerStream};

#[cfg(feature = "tcp")]
pub use transport::TcpDialer;
