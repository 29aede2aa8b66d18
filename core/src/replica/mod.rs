//! Replica store: named CRDT instances owned by one node
//!
//! The store is the single entry point through which CRDT state is read and
//! written. It serializes access per instance, runs the conflict engine
//! after every merge, logs deltas for the network layer and publishes
//! events to subscribers.
//!
//! # Example
//!
//! ```
//! use meshkit_core::crdt::{Crdt, CrdtKind, PnCounter};
//! use meshkit_core::replica::ReplicaStore;
//!
//! let store = ReplicaStore::new("node-a");
//! store.create_empty("page-views", CrdtKind::PnCounter).unwrap();
//! store
//!     .mutate("page-views", |counter: &mut PnCounter, replica, _clock| {
//!         Ok(counter.increment(replica, 3))
//!     })
//!     .unwrap();
//!
//! assert_eq!(store.value("page-views").unwrap(), serde_json::json!(3));
//! ```

mod events;
mod instance;
mod log;

pub use events::StoreEvent;
pub use instance::Replica;
pub use log::{Backlog, DeltaLog, LogEntry};

use crate::conflict::{AuditEntry, AuditKey, AuditLog, ConflictEngine, Evaluation};
use crate::crdt::{CrdtKind, CrdtValue, CrdtVariant};
use crate::error::{Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::storage::StorageAdapter;
use crate::sync::{SystemClock, TimestampSource, VectorClock};
use crate::{ObjectId, ReplicaId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Timestamp source owned by a store
pub type StoreClock = Box<dyn TimestampSource + Send>;

/// Default number of retained log entries
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

const EVENT_CAPACITY: usize = 1024;

/// Storage key of the store's own record; not usable as an object id
pub const STORE_META_KEY: &str = "_meshkit.store";

/// Persisted next to the instances by [`ReplicaStore::snapshot_to`]
#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    replica_id: ReplicaId,
    /// Local origin sequences issued so far
    produced: u64,
    #[serde(default)]
    audit: AuditLog,
}

/// Outcome of applying a remote delta
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Merged and logged under this local sequence
    Applied { seq: u64 },
    /// Already seen via another path
    Duplicate,
}

/// Named CRDT instances with conflict evaluation and a delta log
pub struct ReplicaStore {
    replica_id: ReplicaId,
    instances: RwLock<BTreeMap<ObjectId, Arc<Replica>>>,
    engine: Mutex<ConflictEngine>,
    log: Mutex<DeltaLog>,
    clock: Mutex<StoreClock>,
    events: broadcast::Sender<StoreEvent>,
    metrics: Arc<SyncMetrics>,
}

impl ReplicaStore {
    /// Store with a wall-clock timestamp source and default engine
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        let replica_id = replica_id.into();
        let engine = ConflictEngine::new(replica_id.clone());
        Self::with_parts(replica_id, engine, Box::new(SystemClock::new()), DEFAULT_LOG_CAPACITY)
    }

    pub fn with_parts(
        replica_id: impl Into<ReplicaId>,
        engine: ConflictEngine,
        clock: StoreClock,
        log_capacity: usize,
    ) -> Self {
        let replica_id = replica_id.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            log: Mutex::new(DeltaLog::new(replica_id.clone(), log_capacity)),
            replica_id,
            instances: RwLock::new(BTreeMap::new()),
            engine: Mutex::new(engine),
            clock: Mutex::new(clock),
            events,
            metrics: Arc::new(SyncMetrics::new()),
        }
    }

    /// Share a metrics registry (the network node passes its own)
    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register an instance with an initial state
    ///
    /// A non-empty initial state is logged as a delta so peers learn it.
    pub fn create(&self, object_id: impl Into<ObjectId>, value: CrdtValue) -> Result<Arc<Replica>> {
        let object_id = object_id.into();
        if object_id == STORE_META_KEY {
            return Err(SyncError::InvalidOperation(format!(
                "'{}' is reserved",
                STORE_META_KEY
            )));
        }
        value.validate()?;
        let kind = value.kind();
        let replica = {
            let mut instances = self.instances.write();
            if let Some(existing) = instances.get(&object_id) {
                if existing.kind() != kind {
                    return Err(SyncError::TypeMismatch {
                        expected: existing.kind().as_str(),
                        found: kind.as_str(),
                    });
                }
                return Ok(existing.clone());
            }
            let replica = Arc::new(Replica::new(object_id.clone(), value.clone()));
            instances.insert(object_id.clone(), replica.clone());
            replica
        };

        if value != CrdtValue::empty(kind) {
            self.log_local(&object_id, value);
        }
        Ok(replica)
    }

    pub fn create_empty(&self, object_id: impl Into<ObjectId>, kind: CrdtKind) -> Result<Arc<Replica>> {
        self.create(object_id, CrdtValue::empty(kind))
    }

    pub fn get(&self, object_id: &str) -> Result<Arc<Replica>> {
        self.instances
            .read()
            .get(object_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("object '{}'", object_id)))
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.instances.read().contains_key(object_id)
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.instances.read().keys().cloned().collect()
    }

    /// Read-only projection of an instance as JSON
    pub fn value(&self, object_id: &str) -> Result<serde_json::Value> {
        self.get(object_id)?.value_json()
    }

    pub fn snapshot(&self, object_id: &str) -> Result<CrdtValue> {
        Ok(self.get(object_id)?.snapshot())
    }

    pub fn read<T: CrdtVariant, R>(&self, object_id: &str, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.get(object_id)?.read(f)
    }

    /// Apply a local mutation
    ///
    /// `f` receives the typed state, the local replica id and the store's
    /// timestamp source, and returns the delta the mutator produced. The
    /// delta (plus any automatic conflict repair) is logged for gossip and
    /// announced as [`StoreEvent::DeltaProduced`].
    pub fn mutate<T, F>(&self, object_id: &str, f: F) -> Result<T>
    where
        T: CrdtVariant,
        F: FnOnce(&mut T, &str, &mut StoreClock) -> Result<T>,
    {
        let replica = self.get(object_id)?;
        let mut state = replica.lock_for_write()?;
        let mut clock = self.clock.lock();

        let before = state.value.clone();
        let mutated = state
            .value
            .downcast_mut::<T>()
            .and_then(|inner| f(inner, &self.replica_id, &mut *clock));
        let delta = match mutated {
            Ok(delta) => delta,
            Err(err) => {
                state.value = before;
                return Err(err);
            }
        };

        if let Err(err) = state.value.validate() {
            let reason = err.to_string();
            state.value = before;
            state.frozen = Some(reason.clone());
            drop(state);
            self.on_frozen(object_id, &reason);
            return Err(err);
        }

        let mut outgoing = delta.clone().into_value();
        let evaluation = if is_specialized(before.kind()) {
            let evaluated = self
                .engine
                .lock()
                .evaluate(object_id, Some(&before), &mut state.value, false, &mut *clock)
                .and_then(|evaluation| {
                    if let Some(repair) = &evaluation.repair {
                        outgoing.merge(repair)?;
                    }
                    Ok(evaluation)
                });
            match evaluated {
                Ok(evaluation) => Some(evaluation),
                Err(err) => {
                    // Unlogged changes must not stay applied
                    state.value = before;
                    return Err(err);
                }
            }
        } else {
            None
        };
        drop(state);

        if let Some(evaluation) = &evaluation {
            self.on_evaluation(evaluation);
        }
        self.log_local(object_id, outgoing);
        Ok(delta)
    }

    fn log_local(&self, object_id: &str, delta: CrdtValue) -> u64 {
        let kind = delta.kind();
        let seq = self.log.lock().append_local(object_id, delta).seq;
        debug!(object = object_id, seq, %kind, "delta produced");
        self.publish(StoreEvent::DeltaProduced {
            object_id: object_id.to_string(),
            kind,
            seq,
        });
        seq
    }

    /// Merge a delta received from peer `from`
    ///
    /// Unknown objects are created empty. Duplicates (every origin
    /// sequence already seen) are skipped. A delta that breaks an invariant is
    /// rejected and freezes the instance; a variant mismatch fails this
    /// delta only.
    pub fn apply_remote(
        &self,
        object_id: &str,
        delta: &CrdtValue,
        origin: &str,
        origin_seqs: &[u64],
        from: &str,
        hops: u32,
    ) -> Result<ApplyOutcome> {
        if self.log.lock().is_duplicate(origin, origin_seqs) {
            self.metrics.record_duplicate();
            return Ok(ApplyOutcome::Duplicate);
        }

        let replica = self.create_empty(object_id, delta.kind())?;
        let mut state = replica.lock_for_write()?;
        let before = state.value.clone();
        state.value.apply_delta(delta)?;

        if let Err(err) = state.value.validate() {
            let reason = err.to_string();
            state.value = before;
            state.frozen = Some(reason.clone());
            drop(state);
            self.on_frozen(object_id, &reason);
            return Err(err);
        }

        let evaluation = {
            let mut clock = self.clock.lock();
            self.engine.lock().evaluate(
                object_id,
                Some(&before),
                &mut state.value,
                true,
                &mut *clock,
            )?
        };
        drop(state);

        let seq = match self
            .log
            .lock()
            .append_remote(object_id, delta.clone(), origin, origin_seqs, from, hops)
        {
            Some(entry) => entry.seq,
            None => return Ok(ApplyOutcome::Duplicate),
        };
        self.publish(StoreEvent::DeltaApplied {
            object_id: object_id.to_string(),
            origin: origin.to_string(),
            seq,
        });

        self.on_evaluation(&evaluation);
        if let Some(repair) = evaluation.repair {
            self.log_local(object_id, repair);
        }
        Ok(ApplyOutcome::Applied { seq })
    }

    /// Merge a full state snapshot sent by `from` (log-truncation fallback)
    ///
    /// Whatever the snapshot added is logged as a locally originated delta
    /// so it keeps relaying to peers that only talk to this node. Returns
    /// the log sequence of that delta, `None` if nothing changed.
    pub fn merge_full_state(&self, object_id: &str, state: &CrdtValue, from: &str) -> Result<Option<u64>> {
        let replica = self.create_empty(object_id, state.kind())?;
        let mut guard = replica.lock_for_write()?;
        let before = guard.value.clone();
        guard.value.merge(state)?;
        if let Err(err) = guard.value.validate() {
            let reason = err.to_string();
            guard.value = before;
            guard.frozen = Some(reason.clone());
            drop(guard);
            self.on_frozen(object_id, &reason);
            return Err(err);
        }
        let evaluation = {
            let mut clock = self.clock.lock();
            self.engine.lock().evaluate(
                object_id,
                Some(&before),
                &mut guard.value,
                true,
                &mut *clock,
            )?
        };
        let derived = guard.value.to_delta(&before)?;
        drop(guard);
        self.on_evaluation(&evaluation);

        let Some(derived) = derived else {
            return Ok(None);
        };
        let kind = derived.kind();
        let seq = self.log.lock().append_derived(object_id, derived, from).seq;
        debug!(object = object_id, seq, %kind, from, "full state merged and logged");
        self.publish(StoreEvent::DeltaProduced {
            object_id: object_id.to_string(),
            kind,
            seq,
        });
        Ok(Some(seq))
    }

    fn on_evaluation(&self, evaluation: &Evaluation) {
        for conflict in &evaluation.newly_recorded {
            self.metrics.record_conflict(conflict.class);
            self.publish(StoreEvent::ConflictDetected {
                conflict: conflict.clone(),
            });
        }
        if let Some(audit) = &evaluation.audit_delta {
            self.publish(StoreEvent::AuditRecorded { entries: audit.len() });
        }
    }

    fn on_frozen(&self, object_id: &str, reason: &str) {
        error!(object = object_id, reason, "invariant violated, instance frozen");
        self.metrics.record_frozen();
        self.publish(StoreEvent::InstanceFrozen {
            object_id: object_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Administrative: accept merges again after inspection
    pub fn unfreeze(&self, object_id: &str) -> Result<()> {
        let replica = self.get(object_id)?;
        replica.unfreeze()?;
        warn!(object = object_id, "instance unfrozen by administrator");
        Ok(())
    }

    /// Configure strategies, resolvers and workflow definitions
    pub fn configure_conflicts<R>(&self, f: impl FnOnce(&mut ConflictEngine) -> R) -> R {
        f(&mut *self.engine.lock())
    }

    pub fn audit(&self) -> AuditLog {
        self.engine.lock().audit().clone()
    }

    /// Fold in a peer's audit entries; returns how many were new
    pub fn merge_audit(&self, other: &AuditLog) -> usize {
        let added = {
            let mut engine = self.engine.lock();
            let before = engine.audit().len();
            engine.merge_audit(other);
            engine.audit().len() - before
        };
        if added > 0 {
            debug!(added, "audit entries merged");
            self.publish(StoreEvent::AuditRecorded { entries: added });
        }
        added
    }

    /// Audit entries whose keys are not in `known`
    pub fn audit_missing(&self, known: &BTreeSet<AuditKey>) -> AuditLog {
        self.engine.lock().audit().missing_from(known)
    }

    pub fn pending_reviews(&self) -> Vec<AuditEntry> {
        self.engine
            .lock()
            .pending_reviews()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Record a reviewer's decision and replicate the resolving transition
    pub fn decide(&self, fingerprint: &str, chosen_state: &str, reviewer: &str) -> Result<()> {
        let object_id = self
            .pending_reviews()
            .into_iter()
            .find(|entry| entry.fingerprint == fingerprint)
            .map(|entry| entry.object_id)
            .ok_or_else(|| SyncError::NotFound(format!("no pending review {}", fingerprint)))?;

        let replica = self.get(&object_id)?;
        let mut state = replica.lock_for_write()?;
        let (repair, audit) = {
            let mut clock = self.clock.lock();
            self.engine.lock().decide(
                fingerprint,
                chosen_state,
                reviewer,
                &mut state.value,
                &mut *clock,
            )?
        };
        drop(state);

        self.publish(StoreEvent::AuditRecorded { entries: audit.len() });
        if let Some(repair) = repair {
            self.log_local(&object_id, repair);
        }
        Ok(())
    }

    /// Lock the delta log (network layer)
    pub fn with_log<R>(&self, f: impl FnOnce(&mut DeltaLog) -> R) -> R {
        f(&mut *self.log.lock())
    }

    pub fn version_vector(&self) -> VectorClock {
        self.log.lock().version_vector()
    }

    /// Continue local origin sequences after `issued` (see
    /// [`DeltaLog::resume_origin`])
    pub fn resume_origin(&self, issued: u64) -> usize {
        let renumbered = self.log.lock().resume_origin(issued);
        if renumbered > 0 {
            warn!(issued, renumbered, "local deltas renumbered past sequences seen by peers");
        }
        renumbered
    }

    /// Full state of every instance
    pub fn full_state(&self) -> Vec<(ObjectId, CrdtValue)> {
        self.instances
            .read()
            .iter()
            .map(|(id, replica)| (id.clone(), replica.snapshot()))
            .collect()
    }

    /// Persist every instance through `storage`
    ///
    /// The local origin counter and the audit log are saved under
    /// [`STORE_META_KEY`] so a restarted replica keeps its numbering.
    /// Returns the number of instances written.
    pub fn snapshot_to(&self, storage: &dyn StorageAdapter) -> Result<usize> {
        let meta = StoreMeta {
            replica_id: self.replica_id.clone(),
            produced: self.log.lock().produced(),
            audit: self.audit(),
        };
        let states = self.full_state();
        for (object_id, value) in &states {
            storage.save(object_id, &value.to_bytes()?)?;
        }
        storage.save(STORE_META_KEY, &serde_json::to_vec(&meta)?)?;
        Ok(states.len())
    }

    /// Load every instance from `storage`, merging into existing state
    ///
    /// Returns the number of instances read.
    pub fn restore_from(&self, storage: &dyn StorageAdapter) -> Result<usize> {
        let ids: Vec<ObjectId> = storage
            .list()?
            .into_iter()
            .filter(|id| id != STORE_META_KEY)
            .collect();
        if let Some(bytes) = storage.load(STORE_META_KEY)? {
            let meta: StoreMeta = serde_json::from_slice(&bytes)?;
            if meta.replica_id == self.replica_id {
                self.resume_origin(meta.produced);
            } else {
                warn!(stored = %meta.replica_id, "snapshot written by another replica, origin counter not resumed");
            }
            self.merge_audit(&meta.audit);
        }
        for object_id in &ids {
            let Some(bytes) = storage.load(object_id)? else {
                continue;
            };
            let value = CrdtValue::from_bytes(&bytes)?;
            match self.get(object_id) {
                Ok(existing) if existing.kind() == value.kind() => {
                    let mut merged = existing.snapshot();
                    merged.merge(&value)?;
                    existing.replace(merged)?;
                }
                Ok(existing) => {
                    return Err(SyncError::TypeMismatch {
                        expected: existing.kind().as_str(),
                        found: value.kind().as_str(),
                    })
                }
                Err(_) => {
                    self.instances
                        .write()
                        .insert(object_id.clone(), Arc::new(Replica::new(object_id.clone(), value)));
                }
            }
        }
        Ok(ids.len())
    }
}

fn is_specialized(kind: CrdtKind) -> bool {
    matches!(
        kind,
        CrdtKind::TimeSeries | CrdtKind::Graph | CrdtKind::Workflow
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictClass;
    use crate::crdt::{Crdt, GSet, OrSet, PnCounter, WorkflowCrdt};
    use crate::storage::MemoryStorage;

    #[test]
    fn test_mutate_logs_delta_and_publishes() {
        let store = ReplicaStore::new("n1");
        let mut events = store.subscribe();
        store.create_empty("views", CrdtKind::PnCounter).unwrap();

        let delta = store
            .mutate("views", |c: &mut PnCounter, replica, _| Ok(c.increment(replica, 2)))
            .unwrap();

        assert_eq!(delta.value(), 2);
        assert_eq!(store.value("views").unwrap(), serde_json::json!(2));
        assert_eq!(store.with_log(|log| log.head()), 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            StoreEvent::DeltaProduced { seq: 1, .. }
        ));
    }

    #[test]
    fn test_mutate_wrong_type() {
        let store = ReplicaStore::new("n1");
        store.create_empty("views", CrdtKind::PnCounter).unwrap();
        let result = store.mutate("views", |s: &mut GSet<String>, _, _| Ok(s.insert("x".into())));
        assert!(matches!(result, Err(SyncError::TypeMismatch { .. })));
    }

    #[test]
    fn test_remote_delta_creates_and_dedupes() {
        let a = ReplicaStore::new("n1");
        let b = ReplicaStore::new("n2");
        a.create_empty("tags", CrdtKind::OrSet).unwrap();
        let delta = a
            .mutate("tags", |s: &mut OrSet<String>, r, _| Ok(s.add("x".into(), r)))
            .unwrap()
            .into_value();

        let first = b.apply_remote("tags", &delta, "n1", &[1], "n1", 1).unwrap();
        let second = b.apply_remote("tags", &delta, "n1", &[1], "n3", 2).unwrap();

        assert_eq!(first, ApplyOutcome::Applied { seq: 1 });
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert_eq!(b.value("tags").unwrap(), serde_json::json!(["x"]));
        assert_eq!(b.version_vector().get("n1"), 1);
    }

    #[test]
    fn test_invariant_violation_freezes_instance() {
        let store = ReplicaStore::new("n1");
        store.create_empty("tags", CrdtKind::OrSet).unwrap();
        let mut events = store.subscribe();

        // Two different elements under the same tag
        let mut x = OrSet::new();
        x.add("x".to_string(), "n9");
        let mut y = OrSet::new();
        y.add("y".to_string(), "n9");

        store
            .apply_remote("tags", &x.into_value(), "n9", &[1], "n9", 1)
            .unwrap();
        let err = store
            .apply_remote("tags", &y.into_value(), "n9", &[2], "n9", 1)
            .unwrap_err();

        assert!(err.is_fatal_for_instance());
        assert!(store.get("tags").unwrap().is_frozen());
        assert_eq!(store.value("tags").unwrap(), serde_json::json!(["x"]));
        let more = OrSet::<String>::new().into_value();
        assert!(matches!(
            store.apply_remote("tags", &more, "n9", &[3], "n9", 1),
            Err(SyncError::Frozen { .. })
        ));

        let mut saw_frozen = false;
        while let Ok(event) = events.try_recv() {
            saw_frozen |= matches!(event, StoreEvent::InstanceFrozen { .. });
        }
        assert!(saw_frozen);

        store.unfreeze("tags").unwrap();
        assert!(!store.get("tags").unwrap().is_frozen());
    }

    #[test]
    fn test_variant_mismatch_fails_delta_only() {
        let store = ReplicaStore::new("n1");
        store.create_empty("views", CrdtKind::PnCounter).unwrap();
        let wrong = CrdtValue::empty(CrdtKind::GCounter);
        let err = store.apply_remote("views", &wrong, "n2", &[1], "n2", 1).unwrap_err();
        assert!(matches!(err, SyncError::TypeMismatch { .. } | SyncError::StructuralMerge(_)));
        assert!(!store.get("views").unwrap().is_frozen());
    }

    #[test]
    fn test_concurrent_workflow_goes_to_manual_review() {
        let a = ReplicaStore::new("n1");
        let b = ReplicaStore::new("n2");
        let mut events = a.subscribe();

        a.create_empty("order", CrdtKind::Workflow).unwrap();
        let genesis = a
            .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("pending", clock, r))
            .unwrap();
        b.apply_remote("order", &genesis.into_value(), "n1", &[1], "n1", 1)
            .unwrap();

        a.mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("approved", clock, r))
            .unwrap();
        let rejected = b
            .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("rejected", clock, r))
            .unwrap();
        a.apply_remote("order", &rejected.into_value(), "n2", &[1], "n2", 1)
            .unwrap();

        let reviews = a.pending_reviews();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].class, ConflictClass::Semantic);

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            saw_conflict |= matches!(event, StoreEvent::ConflictDetected { .. });
        }
        assert!(saw_conflict);

        a.decide(&reviews[0].fingerprint, "approved", "reviewer-1").unwrap();
        assert!(a.pending_reviews().is_empty());
        assert_eq!(a.value("order").unwrap(), serde_json::json!("approved"));
    }

    #[test]
    fn test_snapshot_and_restore() {
        let store = ReplicaStore::new("n1");
        store.create_empty("views", CrdtKind::PnCounter).unwrap();
        store
            .mutate("views", |c: &mut PnCounter, r, _| Ok(c.increment(r, 5)))
            .unwrap();

        let storage = MemoryStorage::new();
        assert_eq!(store.snapshot_to(&storage).unwrap(), 1);

        let restored = ReplicaStore::new("n1");
        restored.restore_from(&storage).unwrap();
        assert_eq!(restored.value("views").unwrap(), serde_json::json!(5));
    }

    fn last_origin_seqs(store: &ReplicaStore) -> Vec<u64> {
        store.with_log(|log| match log.since(0) {
            Backlog::Entries(entries) => entries
                .last()
                .map(|entry| entry.origin_seqs.clone())
                .unwrap_or_default(),
            Backlog::Truncated { .. } => Vec::new(),
        })
    }

    #[test]
    fn test_failed_mutator_leaves_no_trace() {
        let store = ReplicaStore::new("n1");
        store.create_empty("views", CrdtKind::PnCounter).unwrap();

        let result = store.mutate("views", |c: &mut PnCounter, replica, _| {
            c.increment(replica, 4);
            Err(SyncError::InvalidOperation("rejected by caller".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(store.value("views").unwrap(), serde_json::json!(0));
        assert_eq!(store.with_log(|log| log.head()), 0);
        assert!(!store.get("views").unwrap().is_frozen());
    }

    #[test]
    fn test_restart_continues_origin_sequence() {
        let a = ReplicaStore::new("a");
        let b = ReplicaStore::new("b");
        a.create_empty("views", CrdtKind::PnCounter).unwrap();
        let first = a
            .mutate("views", |c: &mut PnCounter, r, _| Ok(c.increment(r, 1)))
            .unwrap();
        b.apply_remote("views", &first.into_value(), "a", &[1], "a", 1)
            .unwrap();

        let storage = MemoryStorage::new();
        a.snapshot_to(&storage).unwrap();
        drop(a);

        let restarted = ReplicaStore::new("a");
        assert_eq!(restarted.restore_from(&storage).unwrap(), 1);
        let second = restarted
            .mutate("views", |c: &mut PnCounter, r, _| Ok(c.increment(r, 5)))
            .unwrap();
        let seqs = last_origin_seqs(&restarted);
        assert_eq!(seqs, vec![2]);

        let outcome = b
            .apply_remote("views", &second.into_value(), "a", &seqs, "a", 1)
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
        assert_eq!(b.value("views").unwrap(), serde_json::json!(6));
        assert_eq!(restarted.value("views").unwrap(), serde_json::json!(6));
    }

    #[test]
    fn test_snapshot_from_other_replica_keeps_counter() {
        let a = ReplicaStore::new("a");
        a.create_empty("views", CrdtKind::PnCounter).unwrap();
        a.mutate("views", |c: &mut PnCounter, r, _| Ok(c.increment(r, 1)))
            .unwrap();
        let storage = MemoryStorage::new();
        a.snapshot_to(&storage).unwrap();

        let other = ReplicaStore::new("b");
        other.restore_from(&storage).unwrap();
        assert_eq!(other.with_log(|log| log.produced()), 0);
        assert_eq!(other.value("views").unwrap(), serde_json::json!(1));
    }

    #[test]
    fn test_reserved_object_id_rejected() {
        let store = ReplicaStore::new("n1");
        assert!(matches!(
            store.create_empty(STORE_META_KEY, CrdtKind::GCounter),
            Err(SyncError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_full_state_merge_is_logged_for_relay() {
        let mut counter = PnCounter::new();
        counter.increment("a", 7);
        let state = counter.into_value();

        let b = ReplicaStore::new("b");
        let seq = b.merge_full_state("views", &state, "a").unwrap();
        assert_eq!(seq, Some(1));
        assert_eq!(b.value("views").unwrap(), serde_json::json!(7));

        let log_view = |peer: &str| b.with_log(|log| crate::network::outgoing_for(log, peer, 8));
        assert!(matches!(
            log_view("c"),
            crate::network::Outgoing::Deltas { ref deltas, up_to: 1 } if deltas.len() == 1
        ));
        assert!(matches!(
            log_view("a"),
            crate::network::Outgoing::Deltas { ref deltas, .. } if deltas.is_empty()
        ));

        // Nothing new the second time
        assert_eq!(b.merge_full_state("views", &state, "a").unwrap(), None);
    }

    #[test]
    fn test_decision_publishes_audit_entry() {
        let a = ReplicaStore::new("n1");
        let b = ReplicaStore::new("n2");
        a.create_empty("order", CrdtKind::Workflow).unwrap();
        let genesis = a
            .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("pending", clock, r))
            .unwrap();
        b.apply_remote("order", &genesis.into_value(), "n1", &[1], "n1", 1)
            .unwrap();
        a.mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("approved", clock, r))
            .unwrap();
        let rejected = b
            .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("rejected", clock, r))
            .unwrap();
        a.apply_remote("order", &rejected.into_value(), "n2", &[1], "n2", 1)
            .unwrap();

        let mut events = a.subscribe();
        let fingerprint = a.pending_reviews()[0].fingerprint.clone();
        a.decide(&fingerprint, "approved", "reviewer-1").unwrap();
        assert!(matches!(
            events.try_recv().unwrap(),
            StoreEvent::AuditRecorded { entries: 1 }
        ));

        let known = BTreeSet::new();
        assert_eq!(b.merge_audit(&a.audit_missing(&known)), a.audit().len());
        assert!(b
            .audit()
            .value()
            .iter()
            .any(|entry| entry.resolver == "manual:reviewer-1"));
        assert_eq!(b.merge_audit(&a.audit()), 0);
    }
}
