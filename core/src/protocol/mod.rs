//! Wire protocol
//!
//! Messages are Protocol Buffers (prost), one [`Envelope`] per frame.
//! Frames are length-prefixed (`u32` big-endian) over any ordered byte
//! stream; see [`codec`].
//!
//! Conversation on a connection:
//!
//! 1. both sides send `Hello` and validate the peer's `Hello`
//! 2. either side sends `DeltaBatch`es; the receiver answers with `Ack`.
//!    Batches also carry audit entries the peer has not acknowledged.
//! 3. `Resync` asks the peer to resend its log from a sequence

pub mod codec;
pub mod serialize;

use std::collections::HashMap;

/// Version spoken by this build; peers must match exactly
pub const PROTOCOL_VERSION: u32 = 1;

/// Capability every peer must advertise
pub const CAP_DELTA_STATE: &str = "delta-state";
/// Peer understands `full_state` payloads
pub const CAP_FULL_STATE: &str = "full-state";
/// Peer may receive payloads covering several origin sequences
pub const CAP_COMPRESSION: &str = "compression";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub replica_id: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub protocol_version: u32,
    #[prost(string, repeated, tag = "3")]
    pub capabilities: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Highest contiguous origin sequence applied, per origin replica
    #[prost(map = "string, uint64", tag = "4")]
    pub version_vector: HashMap<::prost::alloc::string::String, u64>,
}

/// One delta (or full state) of one object
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaPayload {
    #[prost(string, tag = "1")]
    pub object_id: ::prost::alloc::string::String,
    /// `CrdtKind` name, e.g. `or_set`
    #[prost(string, tag = "2")]
    pub kind: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub origin: ::prost::alloc::string::String,
    #[prost(uint64, repeated, tag = "4")]
    pub origin_seqs: ::prost::alloc::vec::Vec<u64>,
    #[prost(uint32, tag = "5")]
    pub hops: u32,
    /// Serialized inner CRDT state
    #[prost(bytes = "vec", tag = "6")]
    pub state: ::prost::alloc::vec::Vec<u8>,
    /// Snapshot sent because the peer is behind log truncation
    #[prost(bool, tag = "7")]
    pub full_state: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaBatch {
    /// Sender's log sequence this batch completes (0 for a partial batch)
    #[prost(uint64, tag = "1")]
    pub batch_seq: u64,
    #[prost(message, repeated, tag = "2")]
    pub deltas: ::prost::alloc::vec::Vec<DeltaPayload>,
    /// Audit entries the receiver has not acknowledged (JSON `AuditLog`)
    #[prost(bytes = "vec", tag = "3")]
    pub audit: ::prost::alloc::vec::Vec<u8>,
    /// Sender's version vector, on the last batch of a full-state transfer
    #[prost(map = "string, uint64", tag = "4")]
    pub covers: HashMap<::prost::alloc::string::String, u64>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(uint64, tag = "1")]
    pub up_to: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Resync {
    #[prost(uint64, tag = "1")]
    pub since: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Body", tags = "1, 2, 3, 4")]
    pub body: ::core::option::Option<envelope::Body>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        Batch(super::DeltaBatch),
        #[prost(message, tag = "3")]
        Ack(super::Ack),
        #[prost(message, tag = "4")]
        Resync(super::Resync),
    }
}

impl Envelope {
    pub fn hello(hello: Hello) -> Self {
        Self {
            body: Some(envelope::Body::Hello(hello)),
        }
    }

    pub fn batch(batch: DeltaBatch) -> Self {
        Self {
            body: Some(envelope::Body::Batch(batch)),
        }
    }

    pub fn ack(up_to: u64) -> Self {
        Self {
            body: Some(envelope::Body::Ack(Ack { up_to })),
        }
    }

    pub fn resync(since: u64) -> Self {
        Self {
            body: Some(envelope::Body::Resync(Resync { since })),
        }
    }

    /// Short name for logs
    pub fn label(&self) -> &'static str {
        match &self.body {
            Some(envelope::Body::Hello(_)) => "hello",
            Some(envelope::Body::Batch(_)) => "batch",
            Some(envelope::Body::Ack(_)) => "ack",
            Some(envelope::Body::Resync(_)) => "resync",
            None => "empty",
        }
    }
}
