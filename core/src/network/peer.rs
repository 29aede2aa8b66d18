//! Peer table and per-connection state machine
//!
//! ```text
//! Disconnected -> Handshaking -> Synced -> (failure) Retrying -> Synced | Disconnected
//! ```
//!
//! A peer whose retries are exhausted sits out a number of gossip rounds,
//! then becomes eligible again. Only [`PeerTable::remove`] drops a peer for
//! good.

use super::retry::RetryPolicy;
use crate::metrics::PeerReport;
use crate::sync::VectorClock;
use crate::ReplicaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connection state of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Disconnected,
    Handshaking,
    Synced,
    Retrying,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub state: PeerState,
    pub consecutive_failures: u32,
    /// Gossip rounds left before the peer is tried again
    pub excluded_rounds: u32,
    /// Version vector the peer announced at handshake
    pub announced: VectorClock,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            state: PeerState::Disconnected,
            consecutive_failures: 0,
            excluded_rounds: 0,
            announced: VectorClock::new(),
        }
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded_rounds > 0
    }
}

/// What a delivery failure led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retry after the backoff delay for this attempt
    Retry { attempt: u32 },
    /// Attempts exhausted; the peer sits out this many rounds
    Excluded { rounds: u32 },
}

#[derive(Debug)]
pub struct PeerTable {
    peers: BTreeMap<ReplicaId, PeerEntry>,
    policy: RetryPolicy,
    exclusion_rounds: u32,
}

impl PeerTable {
    pub fn new(policy: RetryPolicy, exclusion_rounds: u32) -> Self {
        Self {
            peers: BTreeMap::new(),
            policy,
            exclusion_rounds,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn get(&self, peer: &str) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    pub fn state(&self, peer: &str) -> Option<PeerState> {
        self.peers.get(peer).map(|entry| entry.state)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ReplicaId> {
        self.peers.keys()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn entry(&mut self, peer: &str) -> &mut PeerEntry {
        self.peers
            .entry(peer.to_string())
            .or_insert_with(PeerEntry::new)
    }

    pub fn begin_handshake(&mut self, peer: &str) {
        self.entry(peer).state = PeerState::Handshaking;
    }

    /// Handshake completed
    pub fn synced(&mut self, peer: &str, announced: VectorClock) {
        let entry = self.entry(peer);
        entry.state = PeerState::Synced;
        entry.consecutive_failures = 0;
        entry.excluded_rounds = 0;
        entry.announced = announced;
    }

    /// A round was acknowledged
    pub fn record_success(&mut self, peer: &str) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.consecutive_failures = 0;
            if entry.state == PeerState::Retrying {
                entry.state = PeerState::Synced;
            }
        }
    }

    pub fn record_failure(&mut self, peer: &str) -> FailureOutcome {
        let exclusion_rounds = self.exclusion_rounds;
        let max_attempts = self.policy.max_attempts;
        let entry = self.entry(peer);
        entry.consecutive_failures += 1;
        if entry.state != PeerState::Disconnected {
            entry.state = PeerState::Retrying;
        }
        if entry.consecutive_failures >= max_attempts {
            entry.consecutive_failures = 0;
            entry.excluded_rounds = exclusion_rounds.max(1);
            FailureOutcome::Excluded {
                rounds: entry.excluded_rounds,
            }
        } else {
            FailureOutcome::Retry {
                attempt: entry.consecutive_failures - 1,
            }
        }
    }

    pub fn disconnected(&mut self, peer: &str) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.state = PeerState::Disconnected;
        }
    }

    /// Count a gossip round against every exclusion
    pub fn start_round(&mut self) {
        for entry in self.peers.values_mut() {
            entry.excluded_rounds = entry.excluded_rounds.saturating_sub(1);
        }
    }

    /// Connected, not excluded
    pub fn eligible(&self) -> Vec<ReplicaId> {
        self.peers
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.state, PeerState::Synced | PeerState::Retrying) && !entry.is_excluded()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Disconnected peers whose exclusion has run out (redial candidates)
    pub fn redial_candidates(&self) -> Vec<ReplicaId> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.state == PeerState::Disconnected && !entry.is_excluded())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Administrative removal
    pub fn remove(&mut self, peer: &str) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn report(&self, acked: impl Fn(&str) -> u64) -> Vec<PeerReport> {
        self.peers
            .iter()
            .map(|(id, entry)| PeerReport {
                replica_id: id.clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                excluded_rounds: entry.excluded_rounds,
                acked_seq: acked(id),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table() -> PeerTable {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        };
        PeerTable::new(policy, 2)
    }

    #[test]
    fn test_state_machine() {
        let mut peers = table();
        peers.begin_handshake("b");
        assert_eq!(peers.state("b"), Some(PeerState::Handshaking));
        peers.synced("b", VectorClock::new());
        assert_eq!(peers.eligible(), vec!["b".to_string()]);

        assert_eq!(peers.record_failure("b"), FailureOutcome::Retry { attempt: 0 });
        assert_eq!(peers.state("b"), Some(PeerState::Retrying));
        peers.record_success("b");
        assert_eq!(peers.state("b"), Some(PeerState::Synced));

        peers.disconnected("b");
        assert!(peers.eligible().is_empty());
        assert_eq!(peers.redial_candidates(), vec!["b".to_string()]);
    }

    #[test]
    fn test_exhaustion_excludes_then_readmits() {
        let mut peers = table();
        peers.synced("b", VectorClock::new());
        peers.record_failure("b");
        peers.record_failure("b");
        assert_eq!(peers.record_failure("b"), FailureOutcome::Excluded { rounds: 2 });
        assert!(peers.eligible().is_empty());

        peers.start_round();
        assert!(peers.eligible().is_empty());
        peers.start_round();
        assert_eq!(peers.eligible(), vec!["b".to_string()]);
    }

    #[test]
    fn test_report() {
        let mut peers = table();
        peers.synced("b", VectorClock::new());
        peers.begin_handshake("c");
        let report = peers.report(|id| if id == "b" { 7 } else { 0 });
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].state, PeerState::Synced);
        assert_eq!(report[0].acked_seq, 7);
        assert!(peers.remove("c"));
        assert_eq!(peers.len(), 1);
    }
}
