//! Delta compression
//!
//! Pending deltas for the same object and origin are pre-merged into one
//! before transmission. Merge is associative and commutative, so the
//! receiver ends up in the same state as if every delta had been sent on
//! its own; the merged delta carries all folded origin sequences so
//! downstream dedupe still works.

use crate::crdt::CrdtValue;
use crate::error::Result;
use crate::replica::LogEntry;
use crate::{ObjectId, ReplicaId};
use std::collections::HashMap;

/// A delta queued for one peer
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundDelta {
    pub object_id: ObjectId,
    pub delta: CrdtValue,
    pub origin: ReplicaId,
    pub origin_seqs: Vec<u64>,
    pub hops: u32,
}

impl From<&LogEntry> for OutboundDelta {
    fn from(entry: &LogEntry) -> Self {
        Self {
            object_id: entry.object_id.clone(),
            delta: entry.delta.clone(),
            origin: entry.origin.clone(),
            origin_seqs: entry.origin_seqs.clone(),
            hops: entry.hops,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub input: usize,
    pub output: usize,
    /// Encoded bytes removed by merging
    pub saved_bytes: usize,
}

impl CompressionStats {
    pub fn merged(&self) -> usize {
        self.input - self.output
    }
}

/// Merge deltas sharing `(object_id, origin)`
///
/// Output keeps the order in which each group first appeared. Hop count of
/// a merged delta is the largest of its parts.
pub fn compress(deltas: Vec<OutboundDelta>) -> Result<(Vec<OutboundDelta>, CompressionStats)> {
    let input = deltas.len();
    let mut groups: Vec<(OutboundDelta, Vec<usize>)> = Vec::new();
    let mut index: HashMap<(ObjectId, ReplicaId), usize> = HashMap::new();
    let mut sizes = Vec::with_capacity(input);

    for delta in deltas {
        sizes.push(0usize);
        let position = sizes.len() - 1;
        let key = (delta.object_id.clone(), delta.origin.clone());
        match index.get(&key).copied() {
            Some(slot) => {
                let (target, members) = &mut groups[slot];
                target.delta.merge(&delta.delta)?;
                target.origin_seqs.extend(delta.origin_seqs.iter().copied());
                target.hops = target.hops.max(delta.hops);
                members.push(position);
                sizes[position] = delta.delta.state_bytes()?.len();
            }
            None => {
                index.insert(key, groups.len());
                sizes[position] = delta.delta.state_bytes()?.len();
                groups.push((delta, vec![position]));
            }
        }
    }

    let mut saved_bytes = 0;
    let mut output = Vec::with_capacity(groups.len());
    for (mut delta, members) in groups {
        if members.len() > 1 {
            let before: usize = members.iter().map(|&i| sizes[i]).sum();
            let after = delta.delta.state_bytes()?.len();
            saved_bytes += before.saturating_sub(after);
            delta.origin_seqs.sort_unstable();
            delta.origin_seqs.dedup();
        }
        output.push(delta);
    }

    let stats = CompressionStats {
        input,
        output: output.len(),
        saved_bytes,
    };
    Ok((output, stats))
}
