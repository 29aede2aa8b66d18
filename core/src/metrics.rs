//! Sync metrics for a monitoring collaborator
//!
//! Counters are lock-free atomics updated on the hot path; a dashboard pulls
//! a [`MetricsSnapshot`] (serializable) and never touches CRDT state.

use crate::conflict::ConflictClass;
use crate::network::PeerState;
use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Thread-safe counters shared by the store, optimizer and network tasks
#[derive(Debug, Default)]
pub struct SyncMetrics {
    sync_rounds: AtomicU64,
    failed_rounds: AtomicU64,
    deltas_sent: AtomicU64,
    deltas_received: AtomicU64,
    duplicate_deltas: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    compression_saved_bytes: AtomicU64,
    deltas_compressed: AtomicU64,
    structural_conflicts: AtomicU64,
    semantic_conflicts: AtomicU64,
    frozen_instances: AtomicU64,
    round_latency_micros: AtomicU64,
    round_latency_samples: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round(&self, latency: Duration) {
        self.sync_rounds.fetch_add(1, Ordering::Relaxed);
        self.round_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.round_latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_round(&self) {
        self.failed_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, deltas: usize, bytes: usize) {
        self.deltas_sent.fetch_add(deltas as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, deltas: usize, bytes: usize) {
        self.deltas_received.fetch_add(deltas as u64, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_deltas.fetch_add(1, Ordering::Relaxed);
    }

    /// `merged` deltas were folded away, saving `saved_bytes`
    pub fn record_compression(&self, merged: usize, saved_bytes: usize) {
        self.deltas_compressed.fetch_add(merged as u64, Ordering::Relaxed);
        self.compression_saved_bytes
            .fetch_add(saved_bytes as u64, Ordering::Relaxed);
    }

    pub fn record_conflict(&self, class: ConflictClass) {
        match class {
            ConflictClass::None => {}
            ConflictClass::StructuralOnly => {
                self.structural_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            ConflictClass::Semantic => {
                self.semantic_conflicts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_frozen(&self) {
        self.frozen_instances.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter snapshot; peer reachability is filled in by the node
    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.round_latency_samples.load(Ordering::Relaxed);
        let total = self.round_latency_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            sync_rounds: self.sync_rounds.load(Ordering::Relaxed),
            failed_rounds: self.failed_rounds.load(Ordering::Relaxed),
            deltas_sent: self.deltas_sent.load(Ordering::Relaxed),
            deltas_received: self.deltas_received.load(Ordering::Relaxed),
            duplicate_deltas: self.duplicate_deltas.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            compression_saved_bytes: self.compression_saved_bytes.load(Ordering::Relaxed),
            deltas_compressed: self.deltas_compressed.load(Ordering::Relaxed),
            structural_conflicts: self.structural_conflicts.load(Ordering::Relaxed),
            semantic_conflicts: self.semantic_conflicts.load(Ordering::Relaxed),
            frozen_instances: self.frozen_instances.load(Ordering::Relaxed),
            avg_round_latency_ms: if samples == 0 {
                0.0
            } else {
                total as f64 / samples as f64 / 1000.0
            },
            peers: Vec::new(),
        }
    }
}

/// Reachability of one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReport {
    pub replica_id: ReplicaId,
    pub state: PeerState,
    pub consecutive_failures: u32,
    /// Gossip rounds left before an excluded peer is retried
    pub excluded_rounds: u32,
    /// Highest local log sequence the peer acknowledged
    pub acked_seq: u64,
}

/// Read-only view for dashboards
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sync_rounds: u64,
    pub failed_rounds: u64,
    pub deltas_sent: u64,
    pub deltas_received: u64,
    pub duplicate_deltas: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub compression_saved_bytes: u64,
    pub deltas_compressed: u64,
    pub structural_conflicts: u64,
    pub semantic_conflicts: u64,
    pub frozen_instances: u64,
    pub avg_round_latency_ms: f64,
    pub peers: Vec<PeerReport>,
}

impl MetricsSnapshot {
    pub fn reachable_peers(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.state == PeerState::Synced)
            .count()
    }
}
