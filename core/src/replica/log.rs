//! Sequence-numbered delta log
//!
//! Every delta a node applies (produced locally or received) is appended
//! with a local sequence number. Peers acknowledge by sequence, which gives
//! a per-peer watermark: a sync round sends the entries above it.
//!
//! Deltas keep the identity of the replica that produced them: `origin`
//! plus the origin sequences they cover, where an origin sequence counts
//! only the deltas that replica produced itself. A compressed delta covers
//! several sequences. Receiving the same delta along two gossip paths is
//! detected by those pairs. The contiguous prefix of origin sequences seen
//! per origin forms the node's version vector.
//!
//! A restarted replica must not reuse origin sequences its peers have
//! already seen: [`DeltaLog::resume_origin`] moves the local counter past
//! the highest sequence persisted or announced by a peer.

use crate::crdt::{CrdtKind, CrdtValue};
use crate::sync::VectorClock;
use crate::{ObjectId, ReplicaId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// One logged delta
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub seq: u64,
    pub object_id: ObjectId,
    pub delta: CrdtValue,
    pub origin: ReplicaId,
    /// Origin sequences folded into this delta (one unless compressed)
    pub origin_seqs: Vec<u64>,
    /// Peer the delta arrived from (`None` for local mutations)
    pub received_from: Option<ReplicaId>,
    /// Relay hops so far
    pub hops: u32,
}

impl LogEntry {
    pub fn kind(&self) -> CrdtKind {
        self.delta.kind()
    }
}

/// Entries a peer needs
#[derive(Debug, Clone, PartialEq)]
pub enum Backlog<'a> {
    Entries(Vec<&'a LogEntry>),
    /// Peer is behind the oldest retained entry; send full state instead
    Truncated { oldest_retained: u64 },
}

/// Most out-of-order sequences remembered per origin
///
/// Forgetting a seen sequence only costs a redundant merge if it arrives
/// again; the highest ones are dropped first.
pub const MAX_OUT_OF_ORDER: usize = 4096;

/// Origin sequences seen from one replica
#[derive(Debug, Clone, Default)]
struct OriginWindow {
    /// Every sequence up to here has been seen
    floor: u64,
    /// Seen sequences above the floor
    above: BTreeSet<u64>,
}

impl OriginWindow {
    fn contains(&self, seq: u64) -> bool {
        seq <= self.floor || self.above.contains(&seq)
    }

    fn insert(&mut self, seq: u64) {
        if self.contains(seq) {
            return;
        }
        self.above.insert(seq);
        self.settle();
        while self.above.len() > MAX_OUT_OF_ORDER {
            self.above.pop_last();
        }
    }

    /// Everything up to `seq` is known to be covered
    fn advance_to(&mut self, seq: u64) {
        if seq <= self.floor {
            return;
        }
        self.floor = seq;
        self.above = self.above.split_off(&seq.saturating_add(1));
        self.settle();
    }

    fn settle(&mut self) {
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }
}

#[derive(Debug)]
pub struct DeltaLog {
    local: ReplicaId,
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    produced: u64,
    /// Whether the local counter was ever matched against outside evidence
    resumed: bool,
    origins: BTreeMap<ReplicaId, OriginWindow>,
    acks: BTreeMap<ReplicaId, u64>,
    capacity: usize,
}

impl DeltaLog {
    /// Log retaining at most `capacity` entries
    pub fn new(local: impl Into<ReplicaId>, capacity: usize) -> Self {
        Self {
            local: local.into(),
            entries: VecDeque::new(),
            next_seq: 1,
            produced: 0,
            resumed: false,
            origins: BTreeMap::new(),
            acks: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Sequence of the newest entry (0 when nothing was ever logged)
    pub fn head(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_retained(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.seq)
    }

    /// Origin sequences this replica has issued so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Continue local origin sequences after `issued`
    ///
    /// `issued` is the highest local sequence known to exist elsewhere (a
    /// persisted counter, or a peer's version vector entry for this
    /// replica). Until the first such evidence arrives, local entries are
    /// provisional: a replica restarted under the same id may have reused
    /// sequences its peers already saw. On the first call, and on any later
    /// call proving a higher count, retained local entries are renumbered
    /// above both counters. Returns the number of entries renumbered.
    pub fn resume_origin(&mut self, issued: u64) -> usize {
        if issued == 0 {
            return 0;
        }
        let first = !std::mem::replace(&mut self.resumed, true);
        if !first && issued <= self.produced {
            return 0;
        }
        let mut next = issued.max(self.produced);
        let mut renumbered = 0;
        for entry in self.entries.iter_mut() {
            if entry.origin != self.local {
                continue;
            }
            for seq in entry.origin_seqs.iter_mut() {
                next += 1;
                *seq = next;
            }
            renumbered += 1;
        }
        self.produced = next;
        self.origins
            .entry(self.local.clone())
            .or_default()
            .advance_to(next);
        renumbered
    }

    /// Mark every origin sequence in `covered` as seen
    ///
    /// Used after merging a peer's full state, which includes everything
    /// its version vector counts. Entries for this replica resume the
    /// local counter instead.
    pub fn advance_origins(&mut self, covered: &VectorClock) -> usize {
        let mut renumbered = 0;
        for (origin, &seq) in covered.iter() {
            if *origin == self.local {
                renumbered += self.resume_origin(seq);
            } else {
                self.origins.entry(origin.clone()).or_default().advance_to(seq);
            }
        }
        renumbered
    }

    /// Log a locally produced delta
    pub fn append_local(&mut self, object_id: &str, delta: CrdtValue) -> &LogEntry {
        self.produced += 1;
        let origin_seq = self.produced;
        let origin = self.local.clone();
        self.origins.entry(origin.clone()).or_default().insert(origin_seq);
        self.push(LogEntry {
            seq: 0,
            object_id: object_id.to_string(),
            delta,
            origin,
            origin_seqs: vec![origin_seq],
            received_from: None,
            hops: 0,
        })
    }

    /// Log a delta derived locally from state merged outside the log
    ///
    /// The delta gets a fresh local origin sequence so it relays like any
    /// other, but it is not sent back to `from`.
    pub fn append_derived(&mut self, object_id: &str, delta: CrdtValue, from: &str) -> &LogEntry {
        self.produced += 1;
        let origin_seq = self.produced;
        let origin = self.local.clone();
        self.origins.entry(origin.clone()).or_default().insert(origin_seq);
        self.push(LogEntry {
            seq: 0,
            object_id: object_id.to_string(),
            delta,
            origin,
            origin_seqs: vec![origin_seq],
            received_from: Some(from.to_string()),
            hops: 1,
        })
    }

    /// Log a delta received from `from`; `None` if it was already seen
    pub fn append_remote(
        &mut self,
        object_id: &str,
        delta: CrdtValue,
        origin: &str,
        origin_seqs: &[u64],
        from: &str,
        hops: u32,
    ) -> Option<&LogEntry> {
        if self.is_duplicate(origin, origin_seqs) {
            return None;
        }
        let window = self.origins.entry(origin.to_string()).or_default();
        for seq in origin_seqs {
            window.insert(*seq);
        }
        Some(self.push(LogEntry {
            seq: 0,
            object_id: object_id.to_string(),
            delta,
            origin: origin.to_string(),
            origin_seqs: origin_seqs.to_vec(),
            received_from: Some(from.to_string()),
            hops,
        }))
    }

    fn push(&mut self, mut entry: LogEntry) -> &LogEntry {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        // Just pushed, so never empty
        &self.entries[self.entries.len() - 1]
    }

    /// Whether every sequence in `origin_seqs` was already seen
    pub fn is_duplicate(&self, origin: &str, origin_seqs: &[u64]) -> bool {
        if origin_seqs.is_empty() {
            return false;
        }
        self.origins.get(origin).map_or(false, |window| {
            origin_seqs.iter().all(|seq| window.contains(*seq))
        })
    }

    /// Contiguous origin sequence seen per replica
    pub fn version_vector(&self) -> VectorClock {
        let mut clock = VectorClock::new();
        for (origin, window) in &self.origins {
            clock.update(origin, window.floor);
        }
        clock
    }

    /// Entries with `seq > since`
    pub fn since(&self, since: u64) -> Backlog<'_> {
        match self.entries.front() {
            Some(front) if since + 1 < front.seq => Backlog::Truncated {
                oldest_retained: front.seq,
            },
            None if since < self.head() => Backlog::Truncated {
                oldest_retained: self.next_seq,
            },
            _ => Backlog::Entries(self.entries.iter().filter(|e| e.seq > since).collect()),
        }
    }

    /// Record that `peer` has everything up to `seq`
    pub fn ack(&mut self, peer: &str, seq: u64) {
        let seq = seq.min(self.head());
        let watermark = self.acks.entry(peer.to_string()).or_insert(0);
        *watermark = (*watermark).max(seq);
    }

    pub fn watermark(&self, peer: &str) -> u64 {
        self.acks.get(peer).copied().unwrap_or(0)
    }

    /// Move a peer's watermark back so the next round resends from `seq`
    pub fn rewind(&mut self, peer: &str, seq: u64) {
        if let Some(watermark) = self.acks.get_mut(peer) {
            *watermark = (*watermark).min(seq);
        }
    }

    /// Forget a peer's watermark (administrative removal)
    pub fn forget_peer(&mut self, peer: &str) {
        self.acks.remove(peer);
    }

    /// Drop entries every peer in `peers` has acknowledged
    ///
    /// Returns the number of entries removed.
    pub fn compact<'a>(&mut self, peers: impl IntoIterator<Item = &'a str>) -> usize {
        let floor = peers.into_iter().map(|peer| self.watermark(peer)).min();
        let Some(floor) = floor else {
            return 0;
        };
        let before = self.entries.len();
        while self.entries.front().map_or(false, |e| e.seq <= floor) {
            self.entries.pop_front();
        }
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::GCounter;

    fn delta(n: u64) -> CrdtValue {
        let mut counter = GCounter::new();
        counter.increment("n1", n);
        CrdtValue::from(counter)
    }

    #[test]
    fn test_sequences_and_backlog() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_local("a", delta(1));
        log.append_local("b", delta(2));
        log.append_remote("a", delta(3), "n2", &[1], "n2", 1).unwrap();

        assert_eq!(log.head(), 3);
        match log.since(1) {
            Backlog::Entries(entries) => {
                let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
                assert_eq!(seqs, vec![2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_remote_delta_rejected() {
        let mut log = DeltaLog::new("n1", 100);
        assert!(log.append_remote("a", delta(1), "n2", &[1], "n2", 1).is_some());
        assert!(log.append_remote("a", delta(1), "n2", &[1], "n3", 2).is_none());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_version_vector_tracks_contiguous_prefix() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_remote("a", delta(1), "n2", &[1], "n2", 1);
        log.append_remote("a", delta(1), "n2", &[3], "n2", 1);
        assert_eq!(log.version_vector().get("n2"), 1);

        log.append_remote("a", delta(1), "n2", &[2], "n2", 1);
        assert_eq!(log.version_vector().get("n2"), 3);
    }

    #[test]
    fn test_capacity_truncation_requests_full_state() {
        let mut log = DeltaLog::new("n1", 2);
        for n in 1..=4 {
            log.append_local("a", delta(n));
        }
        assert_eq!(log.oldest_retained(), Some(3));
        assert!(matches!(log.since(0), Backlog::Truncated { oldest_retained: 3 }));
        assert!(matches!(log.since(2), Backlog::Entries(ref e) if e.len() == 2));
    }

    #[test]
    fn test_compaction_waits_for_every_peer() {
        let mut log = DeltaLog::new("n1", 100);
        for n in 1..=3 {
            log.append_local("a", delta(n));
        }
        log.ack("n2", 3);
        log.ack("n3", 1);

        assert_eq!(log.compact(["n2", "n3"]), 1);
        assert_eq!(log.oldest_retained(), Some(2));
        assert!(matches!(log.since(1), Backlog::Entries(ref e) if e.len() == 2));
    }

    #[test]
    fn test_compressed_delta_dedupes_on_all_sequences() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_remote("a", delta(1), "n2", &[1], "n2", 1);
        assert!(!log.is_duplicate("n2", &[1, 2]));
        assert!(log.append_remote("a", delta(2), "n2", &[1, 2], "n3", 2).is_some());
        assert!(log.is_duplicate("n2", &[2]));
        assert_eq!(log.version_vector().get("n2"), 2);
    }

    #[test]
    fn test_rewind_resends_backlog() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_local("a", delta(1));
        log.ack("n2", 1);
        log.rewind("n2", 0);
        assert_eq!(log.watermark("n2"), 0);
        assert!(matches!(log.since(0), Backlog::Entries(ref e) if e.len() == 1));
    }

    #[test]
    fn test_ack_never_moves_backwards() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_local("a", delta(1));
        log.append_local("a", delta(2));
        log.ack("n2", 2);
        log.ack("n2", 1);
        assert_eq!(log.watermark("n2"), 2);
    }

    #[test]
    fn test_resume_origin_renumbers_stale_local_entries() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_local("a", delta(1));
        log.append_remote("a", delta(2), "n2", &[1], "n2", 1);
        log.append_local("a", delta(3));

        assert_eq!(log.resume_origin(5), 2);
        let origin_seqs: Vec<(String, Vec<u64>)> = match log.since(0) {
            Backlog::Entries(entries) => entries
                .iter()
                .map(|e| (e.origin.clone(), e.origin_seqs.clone()))
                .collect(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            origin_seqs,
            vec![
                ("n1".to_string(), vec![6]),
                ("n2".to_string(), vec![1]),
                ("n1".to_string(), vec![7])
            ]
        );
        assert_eq!(log.version_vector().get("n1"), 7);
        assert_eq!(log.append_local("a", delta(4)).origin_seqs, vec![8]);

        // Already past it: nothing to do
        assert_eq!(log.resume_origin(3), 0);
        assert_eq!(log.produced(), 8);
    }

    #[test]
    fn test_first_resume_renumbers_even_at_equal_count() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_local("a", delta(1));

        // A peer saw seq 1 from a previous run under this id
        assert_eq!(log.resume_origin(1), 1);
        assert_eq!(log.produced(), 2);

        // Later announcements at or below the counter are our own sequences
        assert_eq!(log.resume_origin(2), 0);
        assert_eq!(log.append_local("a", delta(2)).origin_seqs, vec![3]);
    }

    #[test]
    fn test_covered_origins_close_gaps() {
        let mut log = DeltaLog::new("n1", 100);
        log.append_remote("a", delta(1), "n2", &[2], "n2", 1);
        log.append_remote("a", delta(1), "n2", &[5], "n2", 1);
        assert_eq!(log.version_vector().get("n2"), 0);

        let mut covered = VectorClock::new();
        covered.update("n2", 4);
        covered.update("n1", 3);
        log.advance_origins(&covered);

        assert_eq!(log.version_vector().get("n2"), 5);
        assert!(log.is_duplicate("n2", &[3]));
        assert_eq!(log.produced(), 3);
    }

    #[test]
    fn test_out_of_order_window_is_bounded() {
        let mut log = DeltaLog::new("n1", 10);
        for seq in 0..(MAX_OUT_OF_ORDER as u64 + 10) {
            log.append_remote("a", delta(1), "n2", &[seq + 2], "n2", 1);
        }
        let window = &log.origins["n2"];
        assert_eq!(window.above.len(), MAX_OUT_OF_ORDER);
        assert_eq!(window.floor, 0);
        // Dropped sequences are merely re-applied
        assert!(!log.is_duplicate("n2", &[MAX_OUT_OF_ORDER as u64 + 11]));
        assert!(log.is_duplicate("n2", &[2]));
    }

    #[test]
    fn test_derived_entry_skips_its_source() {
        let mut log = DeltaLog::new("n1", 100);
        let entry = log.append_derived("a", delta(1), "n2");
        assert_eq!(entry.origin, "n1");
        assert_eq!(entry.origin_seqs, vec![1]);
        assert_eq!(entry.received_from.as_deref(), Some("n2"));
        assert_eq!(log.version_vector().get("n1"), 1);
    }
}
