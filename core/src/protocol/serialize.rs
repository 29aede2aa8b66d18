//! Serialization layer - Convert CRDT deltas to/from Protocol Buffers
//!
//! The CRDT state inside a payload is opaque bytes (`CrdtValue::state_bytes`);
//! the kind travels next to it so the receiver can decode without the
//! serde tag.

use crate::conflict::AuditLog;
use crate::crdt::{CrdtKind, CrdtValue};
use crate::error::{Result, SyncError};
use crate::optimizer::OutboundDelta;
use crate::protocol::*;
use bytes::{Bytes, BytesMut};
use prost::Message;

/// Decoded payload ready to hand to the replica store
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelta {
    pub object_id: String,
    pub value: CrdtValue,
    pub origin: String,
    pub origin_seqs: Vec<u64>,
    pub hops: u32,
    pub full_state: bool,
}

/// Serialize a queued delta to protocol format
pub fn serialize_delta(delta: &OutboundDelta) -> Result<DeltaPayload> {
    Ok(DeltaPayload {
        object_id: delta.object_id.clone(),
        kind: delta.delta.kind().as_str().to_string(),
        origin: delta.origin.clone(),
        origin_seqs: delta.origin_seqs.clone(),
        hops: delta.hops,
        state: delta.delta.state_bytes()?,
        full_state: false,
    })
}

/// Serialize a full instance state (log-truncation fallback)
pub fn serialize_full_state(object_id: &str, value: &CrdtValue) -> Result<DeltaPayload> {
    Ok(DeltaPayload {
        object_id: object_id.to_string(),
        kind: value.kind().as_str().to_string(),
        origin: String::new(),
        origin_seqs: Vec::new(),
        hops: 0,
        state: value.state_bytes()?,
        full_state: true,
    })
}

/// Deserialize a payload, checking the state's invariants
pub fn deserialize_delta(payload: &DeltaPayload) -> Result<InboundDelta> {
    if payload.object_id.is_empty() {
        return Err(SyncError::Protocol("payload without object id".to_string()));
    }
    if !payload.full_state && (payload.origin.is_empty() || payload.origin_seqs.is_empty()) {
        return Err(SyncError::Protocol(format!(
            "delta for '{}' has no origin",
            payload.object_id
        )));
    }
    let kind = CrdtKind::parse(&payload.kind)?;
    let value = CrdtValue::from_state_bytes(kind, &payload.state)?;
    Ok(InboundDelta {
        object_id: payload.object_id.clone(),
        value,
        origin: payload.origin.clone(),
        origin_seqs: payload.origin_seqs.clone(),
        hops: payload.hops,
        full_state: payload.full_state,
    })
}

/// Audit entries for a batch; an empty log travels as no bytes
pub fn encode_audit(audit: &AuditLog) -> Result<Vec<u8>> {
    if audit.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::to_vec(audit)?)
}

pub fn decode_audit(bytes: &[u8]) -> Result<AuditLog> {
    if bytes.is_empty() {
        return Ok(AuditLog::default());
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize any protocol message to bytes
pub fn encode_message<M: Message>(msg: &M) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)
        .map_err(|e| SyncError::Protocol(format!("Failed to encode message: {}", e)))?;
    Ok(buf.freeze())
}

/// Deserialize a protocol message from bytes
pub fn decode_message<M: Message + Default>(bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(|e| SyncError::Protocol(format!("Failed to decode message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{CrdtVariant, GraphCrdt, PnCounter};

    #[test]
    fn test_delta_payload_conversion() {
        let mut counter = PnCounter::new();
        counter.increment("n1", 5);
        counter.decrement("n2", 2);
        let outbound = OutboundDelta {
            object_id: "score".into(),
            delta: counter.into_value(),
            origin: "n1".into(),
            origin_seqs: vec![3, 4],
            hops: 2,
        };

        let payload = serialize_delta(&outbound).unwrap();
        assert_eq!(payload.kind, "pn_counter");

        let bytes = encode_message(&payload).unwrap();
        let decoded: DeltaPayload = decode_message(&bytes).unwrap();
        let inbound = deserialize_delta(&decoded).unwrap();

        assert_eq!(inbound.value, outbound.delta);
        assert_eq!(inbound.origin_seqs, vec![3, 4]);
        assert_eq!(inbound.hops, 2);
        assert!(!inbound.full_state);
    }

    #[test]
    fn test_full_state_needs_no_origin() {
        let payload = serialize_full_state("g", &GraphCrdt::new().into_value()).unwrap();
        let inbound = deserialize_delta(&payload).unwrap();
        assert!(inbound.full_state);
        assert_eq!(inbound.value.kind(), CrdtKind::Graph);
    }

    #[test]
    fn test_rejects_unknown_kind_and_missing_origin() {
        let mut payload = serialize_full_state("g", &GraphCrdt::new().into_value()).unwrap();
        payload.kind = "text".into();
        assert!(matches!(deserialize_delta(&payload), Err(SyncError::Protocol(_))));

        let mut payload = serialize_full_state("g", &GraphCrdt::new().into_value()).unwrap();
        payload.full_state = false;
        assert!(matches!(deserialize_delta(&payload), Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<Envelope> = decode_message(&[0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }
}
