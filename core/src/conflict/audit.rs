//! Append-only audit trail of conflicts and their resolutions
//!
//! The log is a grow-only map keyed by `(recorded_by, seq)`: each replica
//! appends under its own sequence, so two replicas never write the same key
//! and merging is a plain union. Entries are never modified; a decision on
//! a pending review is a new entry with the same fingerprint.

use super::ConflictClass;
use crate::crdt::Crdt;
use crate::{ObjectId, ReplicaId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How a conflict was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    /// Structural merge already settled it
    Accepted,
    /// LWW winner kept
    KeptLatest { state: Option<String> },
    /// A resolver or reviewer chose a state
    Chosen { state: String },
    /// Waiting for an external decision
    PendingReview,
    /// The conflict disappeared before review (resolved elsewhere)
    Superseded,
}

impl Resolution {
    pub fn is_pending(&self) -> bool {
        matches!(self, Resolution::PendingReview)
    }
}

/// Key of an audit entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuditKey {
    pub recorded_by: ReplicaId,
    pub seq: u64,
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub object_id: ObjectId,
    pub fingerprint: String,
    pub class: ConflictClass,
    pub recorded_at: DateTime<Utc>,
    /// The operations in contention
    pub operations: Vec<serde_json::Value>,
    pub resolution: Resolution,
    /// Strategy, resolver or reviewer that produced the resolution
    pub resolver: String,
    pub description: String,
}

/// Replicable audit trail
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(with = "crate::crdt::pairs")]
    entries: BTreeMap<AuditKey, AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry as `replica`; returns the delta
    pub fn append(&mut self, replica: &str, entry: AuditEntry) -> AuditLog {
        let seq = self
            .entries
            .keys()
            .filter(|key| key.recorded_by == replica)
            .map(|key| key.seq)
            .max()
            .unwrap_or(0)
            + 1;
        let key = AuditKey {
            recorded_by: replica.to_string(),
            seq,
        };
        self.entries.insert(key.clone(), entry.clone());

        let mut delta = AuditLog::new();
        delta.entries.insert(key, entry);
        delta
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in recording order
    pub fn entries(&self) -> Vec<(&AuditKey, &AuditEntry)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.1.recorded_at.cmp(&b.1.recorded_at).then_with(|| a.0.cmp(b.0)));
        entries
    }

    pub fn for_object(&self, object_id: &str) -> Vec<&AuditEntry> {
        self.entries()
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.object_id == object_id)
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &AuditKey> {
        self.entries.keys()
    }

    /// Entries whose keys are not in `known`
    pub fn missing_from(&self, known: &BTreeSet<AuditKey>) -> AuditLog {
        AuditLog {
            entries: self
                .entries
                .iter()
                .filter(|(key, _)| !known.contains(*key))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
        }
    }

    /// Whether `replica` already recorded anything for `fingerprint`
    pub fn has_record(&self, replica: &str, fingerprint: &str) -> bool {
        self.entries
            .iter()
            .any(|(key, entry)| key.recorded_by == replica && entry.fingerprint == fingerprint)
    }

    /// Fingerprints with a terminal (non-pending) entry from any replica
    pub fn settled(&self) -> BTreeSet<&str> {
        self.entries
            .values()
            .filter(|entry| !entry.resolution.is_pending())
            .map(|entry| entry.fingerprint.as_str())
            .collect()
    }

    /// Reviews still waiting for a decision
    pub fn pending_reviews(&self) -> Vec<&AuditEntry> {
        let settled = self.settled();
        let mut seen = BTreeSet::new();
        self.entries()
            .into_iter()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.resolution.is_pending())
            .filter(|entry| !settled.contains(entry.fingerprint.as_str()))
            .filter(|entry| seen.insert(entry.fingerprint.as_str()))
            .collect()
    }

    /// Counts of audited conflicts by class
    pub fn class_counts(&self) -> BTreeMap<ConflictClass, u64> {
        let mut counts = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for entry in self.entries.values() {
            if seen.insert(entry.fingerprint.as_str()) {
                *counts.entry(entry.class).or_insert(0) += 1;
            }
        }
        counts
    }
}

fn canonical(entry: &AuditEntry) -> String {
    serde_json::to_string(entry).unwrap_or_default()
}

impl Crdt for AuditLog {
    type Value = Vec<AuditEntry>;

    fn merge(&mut self, other: &Self) {
        for (key, entry) in &other.entries {
            match self.entries.get(key) {
                None => {
                    self.entries.insert(key.clone(), entry.clone());
                }
                // Keys are single-writer; if two ever diverge keep a canonical pick
                Some(existing) if existing != entry && canonical(entry) > canonical(existing) => {
                    self.entries.insert(key.clone(), entry.clone());
                }
                Some(_) => {}
            }
        }
    }

    fn value(&self) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    fn to_delta(&self, since: &Self) -> Option<Self> {
        let entries: BTreeMap<AuditKey, AuditEntry> = self
            .entries
            .iter()
            .filter(|(key, entry)| since.entries.get(*key) != Some(*entry))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(AuditLog { entries })
        }
    }
}
