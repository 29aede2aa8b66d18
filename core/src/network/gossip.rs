//! Gossip target selection and outgoing batch assembly

use crate::optimizer::OutboundDelta;
use crate::replica::{Backlog, DeltaLog};
use crate::ReplicaId;
use rand::seq::SliceRandom;
use rand::Rng;

/// Pick up to `fanout` distinct peers at random
pub fn select_targets<R: Rng + ?Sized>(candidates: &[ReplicaId], fanout: usize, rng: &mut R) -> Vec<ReplicaId> {
    candidates
        .choose_multiple(rng, fanout)
        .cloned()
        .collect()
}

/// What one peer needs from the local log
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Peer is up to date
    Nothing,
    /// Deltas above the peer's watermark, completing `up_to`
    Deltas {
        deltas: Vec<OutboundDelta>,
        up_to: u64,
    },
    /// Peer is behind log truncation; send every instance's full state
    FullState { up_to: u64 },
}

/// Deltas for `peer` since its acknowledged watermark
///
/// Entries the peer itself sent us are skipped, as are relayed entries
/// that already used up the hop budget. Skipped entries still count as
/// covered by `up_to`.
pub fn outgoing_for(log: &DeltaLog, peer: &str, max_relay_hops: u32) -> Outgoing {
    let watermark = log.watermark(peer);
    let up_to = log.head();
    if watermark >= up_to {
        return Outgoing::Nothing;
    }
    match log.since(watermark) {
        Backlog::Truncated { .. } => Outgoing::FullState { up_to },
        Backlog::Entries(entries) => {
            let deltas = entries
                .into_iter()
                .filter(|entry| entry.received_from.as_deref() != Some(peer))
                .filter(|entry| entry.origin != peer)
                .filter(|entry| entry.hops < max_relay_hops)
                .map(OutboundDelta::from)
                .collect();
            Outgoing::Deltas { deltas, up_to }
        }
    }
}
